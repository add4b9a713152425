pub mod chunk;
pub mod metainfo;
pub mod prompb;
pub mod read;
pub mod write;
