pub mod correlation;
pub mod device_link;
pub mod driver;
pub mod predictor;
pub mod protocol;
pub mod scheduler;
pub mod script;
pub mod segmenter;
pub mod sim_server;
pub mod types;
pub mod ws;
