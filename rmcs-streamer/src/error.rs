use thiserror::Error;

#[derive(Error, Debug)]
#[error(transparent)]
pub struct AppError(Box<ErrorKind>);

#[derive(Error, Debug)]
#[error(transparent)]
pub enum ErrorKind {
    #[error("SerdeJsonError: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),
    #[error("WebRTCError: {0}")]
    WebRTCError(#[from] webrtc::Error),
    #[error("MqttClientError: {0}")]
    MqttClientError(#[from] rumqttc::ClientError),
    #[error("MqttConnectionError: {0}")]
    MqttConnectionError(#[from] rumqttc::ConnectionError),
    #[error("no source configured for camera index {0}")]
    UnknownCamera(i32),
    #[error("source adapter failed to open: {0}")]
    AdapterOpenFailed(String),
    #[error("peer {0} is unknown")]
    UnknownPeer(String),
    #[error("malformed topic: {0}")]
    MalformedTopic(String),
    #[error("rmcs-streamer is not initialized")]
    NotInitialized,
    #[error("rmcs-streamer is already initialized")]
    AlreadyInitialized,
}

impl<E> From<E> for AppError
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        AppError(Box::new(ErrorKind::from(err)))
    }
}

impl AppError {
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
