use std::{fmt, io};

#[derive(Debug)]
pub enum SplatError {
    Config(String),
    ParseSplat(String),
    EmptyCloud,
    IoError(io::Error),
}

impl fmt::Display for SplatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplatError::Config(e) => {
                write!(f, "Invalid configuration: {}", e)
            }
            SplatError::ParseSplat(e) => {
                write!(f, "Failed to parse splats from the buffer: {}", e)
            }
            SplatError::EmptyCloud => {
                write!(f, "The splat cloud is empty.")
            }
            SplatError::IoError(e) => {
                write!(f, "An I/O error occurred: {}", e)
            }
        }
    }
}

impl std::error::Error for SplatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SplatError::IoError(e) => Some(e),
            _ => None,
        }
    }
}
