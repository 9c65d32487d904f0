pub mod diagral;
pub mod mqtt;
