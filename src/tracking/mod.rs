mod parser;

pub use parser::{current_active, mark_active, mark_done, next_pending, parse, StepState, TrackingRow};
