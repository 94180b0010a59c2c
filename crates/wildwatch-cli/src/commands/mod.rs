pub mod common;
pub mod completions;
pub mod forms;
pub mod submissions;
pub mod sync;
