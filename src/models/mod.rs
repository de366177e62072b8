//! Domain model module declarations.

pub mod envelope;
pub mod identity;
pub mod kernel_event;
pub mod lifecycle;
pub mod process_record;
