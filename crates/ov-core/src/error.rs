//! Aggregate error type for consumers that drive more than one parser off a
//! single connection (the App runtime).

use thiserror::Error;

use crate::http::HttpError;
use crate::json_buffer::JsonBufferError;
use crate::ws_frame::WsError;

#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    #[error(transparent)]
    Json(#[from] JsonBufferError),
    #[error(transparent)]
    Ws(#[from] WsError),
    #[error(transparent)]
    Http(#[from] HttpError),
}
