pub mod flat;

pub use flat::{FlatIpIndex, Hit};
