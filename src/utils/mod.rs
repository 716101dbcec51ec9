pub mod o11y;
pub mod photometry;
pub mod spatial;
pub mod testing;
