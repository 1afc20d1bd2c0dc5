//! Audio collaborators: formats, decoders, conversion, and output.

pub mod converter;
pub mod decoder;
pub mod output;
pub mod types;

pub use converter::Converter;
pub use decoder::{Decoder, FileDecoder};
pub use output::{CpalOutput, OutputSink, RenderFn, RenderStatus};
pub use types::{AudioFormat, BitOrder, ChannelLayout, SampleEncoding};
