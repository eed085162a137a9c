pub mod meta;

pub use meta::{Counts, MetaError, MetaStore, Statistic};
