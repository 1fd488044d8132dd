//! Integration-style tests exercising the full pipeline.

mod helpers;
