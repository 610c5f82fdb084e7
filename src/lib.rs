pub mod actor;
pub mod command;
pub mod controller;
pub mod entity;
pub mod guild;
pub mod http;
pub mod notify;
pub mod queue;
pub mod resolver;
pub mod settings;
pub mod sim;
pub mod track;
pub mod transport;

#[cfg(test)]
pub mod test_utils;
