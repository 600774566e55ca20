#![allow(dead_code, unused_imports)]

pub use dagwave_test_utils::builders;
pub use dagwave_test_utils::{init_tracing, with_timeout, Attempt, ScriptedBackend, Step};
