pub mod calibration;
pub mod channel_guard;
pub mod contact_detector;
pub mod controller_config;
pub mod indentation_error;
pub mod indenter_hal;
pub mod indenter_hal_sim;
pub mod pid_controller;
pub mod property_extractor;
pub mod sample;
pub mod sample_buffer;
pub mod sampler;
pub mod test_parameters;
pub mod test_runner;
pub mod test_sequencer;
pub mod test_session;
