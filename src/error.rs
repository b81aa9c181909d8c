//! Error types for streamboard.

use crate::board::network::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamboardError {
    // Topology assembly errors
    #[error("Stage '{name}' is already declared")]
    DuplicateStageName { name: String },

    #[error("Unknown stage: {name}")]
    UnknownStage { name: String },

    #[error("Edge not declared on this board: {edge}")]
    UnknownEdge { edge: String },

    #[error("Stage '{stage}' does not declare {direction} key '{key}'")]
    InvalidKey {
        stage: String,
        key: String,
        direction: &'static str,
    },

    #[error("Board is {actual}, operation requires {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Local edges form a cycle through: {}", stages.join(", "))]
    CyclicTopology { stages: Vec<String> },

    #[error("Failed to build stage '{stage}': {message}")]
    StageBuild { stage: String, message: String },

    // Configuration errors
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Missing required option: {key}")]
    MissingOption { key: String },

    #[error("Option {key} has the wrong type: expected {expected}")]
    InvalidOption { key: String, expected: &'static str },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Network edges
    #[error("Network transport error: {0}")]
    Transport(#[from] TransportError),

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, StreamboardError>;
