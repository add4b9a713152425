//! PromQL rewriting: walk the query AST, swap eligible selectors to their
//! downsampled metric names and widen matrix ranges so rate-style functions
//! keep at least a few points per window.

use std::time::Duration;

use promql_parser::label::{MatchOp as PromMatchOp, Matcher as PromMatcher};
use promql_parser::parser::{Expr, VectorSelector};
use regex::Regex;

use crate::common::METRIC_NAME_LABEL;
use crate::config::{ProxyMetric, Resolution};
use crate::naming::{downsample_suffix, mangle, EXTRAPOLATED_MULTIPLE};
use crate::proxy::policy::pick_instant_resolution;

/// One proxy-eligible metric: queries whose `__name__` matches the pattern
/// are redirected to `<metric>:downsample_<interval>_<agg>`.
pub struct MetricProxyEntry {
    pub pattern: Regex,
    pub metric: String,
    pub agg: String,
}

/// The table swapped whole on reload.
#[derive(Default)]
pub struct MetricProxyTable {
    entries: Vec<MetricProxyEntry>,
}

impl MetricProxyTable {
    pub fn from_config(metrics: &[ProxyMetric]) -> MetricProxyTable {
        let mut entries = Vec::with_capacity(metrics.len());
        for m in metrics {
            match Regex::new(&m.metric_name) {
                Ok(pattern) => entries.push(MetricProxyEntry {
                    pattern,
                    metric: m.metric_name.clone(),
                    agg: m.aggregation.clone(),
                }),
                Err(err) => {
                    tracing::warn!(metric = %m.metric_name, error = %err, "invalid proxy metric pattern")
                }
            }
        }
        MetricProxyTable { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, metric: &str) -> Option<&MetricProxyEntry> {
        self.entries.iter().find(|e| e.pattern.is_match(metric))
    }
}

/// What querying parameters must change after a rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteOutcome {
    pub query: String,
    pub rewritten: bool,
    /// The chosen sample interval when a range-query rewrite fired; the
    /// router doubles the backend's default lookback delta off of it.
    pub lookback_interval: Option<Duration>,
}

impl RewriteOutcome {
    fn unchanged(query: &str) -> RewriteOutcome {
        RewriteOutcome {
            query: query.to_string(),
            rewritten: false,
            lookback_interval: None,
        }
    }
}

/// Rewrites a range query against the resolution already chosen from the
/// query span. A parse failure forwards the original text untouched.
pub fn rewrite_range_query(
    query: &str,
    resolution: &Resolution,
    table: &MetricProxyTable,
) -> RewriteOutcome {
    if table.is_empty() {
        return RewriteOutcome::unchanged(query);
    }
    let mut expr = match promql_parser::parser::parse(query) {
        Ok(expr) => expr,
        Err(_) => return RewriteOutcome::unchanged(query),
    };

    let mut replaced = false;
    walk_range(&mut expr, resolution, table, &mut replaced);

    let rewritten = expr.to_string();
    if replaced {
        tracing::warn!(before = %query, after = %rewritten, "range query replaced");
    }
    RewriteOutcome {
        query: rewritten,
        rewritten: replaced,
        lookback_interval: replaced.then_some(resolution.sample_interval),
    }
}

/// Rewrites an instant query; eligibility is judged per matrix selector on
/// its explicit range window.
pub fn rewrite_instant_query(
    query: &str,
    resolutions_desc: &[Resolution],
    table: &MetricProxyTable,
) -> RewriteOutcome {
    if table.is_empty() {
        return RewriteOutcome::unchanged(query);
    }
    let mut expr = match promql_parser::parser::parse(query) {
        Ok(expr) => expr,
        Err(_) => return RewriteOutcome::unchanged(query),
    };

    let mut replaced = false;
    walk_instant(&mut expr, resolutions_desc, table, &mut replaced);

    let rewritten = expr.to_string();
    if replaced {
        tracing::warn!(before = %query, after = %rewritten, "instant query replaced");
    }
    RewriteOutcome {
        query: rewritten,
        rewritten: replaced,
        lookback_interval: None,
    }
}

fn walk_range(
    expr: &mut Expr,
    resolution: &Resolution,
    table: &MetricProxyTable,
    replaced: &mut bool,
) {
    match expr {
        Expr::MatrixSelector(ms) => {
            if let Some(entry) = selector_entry(&ms.vs, table) {
                *replaced = true;
                // A downsampled series has one point per sample interval;
                // keep the window wide enough for extrapolation.
                let min_range = resolution.sample_interval * EXTRAPOLATED_MULTIPLE;
                if ms.range < min_range {
                    ms.range = min_range;
                }
                let (metric, agg) = (entry.metric.clone(), entry.agg.clone());
                inject_replaced_metric(&mut ms.vs, &metric, &agg, &resolution.interval_text);
            }
        }
        Expr::VectorSelector(vs) => {
            if let Some(entry) = selector_entry(vs, table) {
                *replaced = true;
                let (metric, agg) = (entry.metric.clone(), entry.agg.clone());
                inject_replaced_metric(vs, &metric, &agg, &resolution.interval_text);
            }
        }
        Expr::Aggregate(agg) => {
            walk_range(&mut agg.expr, resolution, table, replaced);
            if let Some(param) = agg.param.as_mut() {
                walk_range(param, resolution, table, replaced);
            }
        }
        Expr::Binary(binary) => {
            walk_range(&mut binary.lhs, resolution, table, replaced);
            walk_range(&mut binary.rhs, resolution, table, replaced);
        }
        Expr::Unary(unary) => walk_range(&mut unary.expr, resolution, table, replaced),
        Expr::Paren(paren) => walk_range(&mut paren.expr, resolution, table, replaced),
        Expr::Subquery(sq) => walk_range(&mut sq.expr, resolution, table, replaced),
        Expr::Call(call) => {
            for arg in call.args.args.iter_mut() {
                walk_range(&mut **arg, resolution, table, replaced);
            }
        }
        _ => {}
    }
}

fn walk_instant(
    expr: &mut Expr,
    resolutions_desc: &[Resolution],
    table: &MetricProxyTable,
    replaced: &mut bool,
) {
    match expr {
        Expr::MatrixSelector(ms) => {
            let entry = selector_entry(&ms.vs, table);
            let resolution = pick_instant_resolution(resolutions_desc, ms.range);
            if let (Some(entry), Some(resolution)) = (entry, resolution) {
                *replaced = true;
                let (metric, agg) = (entry.metric.clone(), entry.agg.clone());
                inject_replaced_metric(&mut ms.vs, &metric, &agg, &resolution.interval_text);
            }
        }
        Expr::Aggregate(agg) => {
            walk_instant(&mut agg.expr, resolutions_desc, table, replaced);
            if let Some(param) = agg.param.as_mut() {
                walk_instant(param, resolutions_desc, table, replaced);
            }
        }
        Expr::Binary(binary) => {
            walk_instant(&mut binary.lhs, resolutions_desc, table, replaced);
            walk_instant(&mut binary.rhs, resolutions_desc, table, replaced);
        }
        Expr::Unary(unary) => walk_instant(&mut unary.expr, resolutions_desc, table, replaced),
        Expr::Paren(paren) => walk_instant(&mut paren.expr, resolutions_desc, table, replaced),
        Expr::Subquery(sq) => walk_instant(&mut sq.expr, resolutions_desc, table, replaced),
        Expr::Call(call) => {
            for arg in call.args.args.iter_mut() {
                walk_instant(&mut **arg, resolutions_desc, table, replaced);
            }
        }
        _ => {}
    }
}

/// The metric name a selector refers to, looked up in the proxy table.
fn selector_entry<'a>(
    vs: &VectorSelector,
    table: &'a MetricProxyTable,
) -> Option<&'a MetricProxyEntry> {
    if let Some(name) = vs.name.as_deref() {
        return table.find(name);
    }
    vs.matchers
        .matchers
        .iter()
        .find(|m| m.name == METRIC_NAME_LABEL)
        .and_then(|m| table.find(&m.value))
}

/// Forces the selector into pure matcher form and swaps the metric name for
/// its downsampled counterpart. Substitution is idempotent: a value already
/// carrying this exact suffix is matched whole and left intact.
fn inject_replaced_metric(vs: &mut VectorSelector, metric: &str, agg: &str, interval: &str) {
    let mangled = mangle(metric, interval, agg);
    let shorthand = vs.name.take();

    if let Some(matcher) = vs
        .matchers
        .matchers
        .iter_mut()
        .find(|m| m.name == METRIC_NAME_LABEL)
    {
        matcher.value = substitute_metric(&matcher.value, metric, interval, agg);
        return;
    }

    // Selector came as a bare metric shorthand; rebuild it as a matcher.
    let value = match shorthand {
        Some(name) => substitute_metric(&name, metric, interval, agg),
        None => mangled,
    };
    vs.matchers.matchers.push(PromMatcher {
        op: PromMatchOp::Equal,
        name: METRIC_NAME_LABEL.to_string(),
        value,
    });
}

/// Replaces `<metric>(:downsample_<interval>_<agg>)?` with the mangled form
/// inside a matcher value, which may be a `|`-joined regex alternation.
fn substitute_metric(value: &str, metric: &str, interval: &str, agg: &str) -> String {
    let mangled = mangle(metric, interval, agg);
    let suffix = downsample_suffix(interval, agg);
    let pattern = format!(r"\b({})(?:{})?\b", metric, regex::escape(&suffix));
    match Regex::new(&pattern) {
        Ok(re) => re
            .replace_all(value, regex::NoExpand(&mangled))
            .into_owned(),
        Err(_) => value.to_string(),
    }
}
