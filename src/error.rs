use std::io;

#[derive(thiserror::Error, Debug)]
pub enum FindDirsError {
    #[error("candle_core error: {0}")]
    Candle(candle_core::Error),

    #[error("Image error: {0}")]
    Image(image::ImageError),

    #[error("IO Error: {0}")]
    Io(io::Error),

    #[error("JSON error: {0}")]
    Json(serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Error: {0:?}")]
    Msg(String),
}

impl From<candle_core::Error> for FindDirsError {
    fn from(value: candle_core::Error) -> Self {
        FindDirsError::Candle(value)
    }
}

impl From<image::ImageError> for FindDirsError {
    fn from(value: image::ImageError) -> Self {
        FindDirsError::Image(value)
    }
}

impl From<io::Error> for FindDirsError {
    fn from(value: io::Error) -> Self {
        FindDirsError::Io(value)
    }
}

impl From<serde_json::Error> for FindDirsError {
    fn from(value: serde_json::Error) -> Self {
        FindDirsError::Json(value)
    }
}

pub type Result<T> = std::result::Result<T, FindDirsError>;
