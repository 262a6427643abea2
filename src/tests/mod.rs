pub mod common;
mod pipeline;
