pub use courier_types::prelude::*;

// vim: ts=4
