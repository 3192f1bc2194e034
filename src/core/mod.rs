// Core modules implementing the mapped log, framing, and error modeling.
pub mod appender;
pub mod error;
pub mod file;
pub mod frame;
pub mod pile;
pub mod pointer;
pub mod region;
pub mod sequencer;
