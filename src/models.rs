use serde::{Deserialize, Serialize};

use crate::db::StoredLink;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckUsernameRequest {
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckLinkRequest {
    #[serde(default)]
    pub link: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadLinkRequest {
    pub link: String,
}

#[derive(Debug, Deserialize)]
pub struct EditLinkRequest {
    #[serde(alias = "id-link")]
    pub id: i64,
    pub link: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteLinkRequest {
    #[serde(alias = "id-link")]
    pub id: i64,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub message: String,
    pub token: String,
    pub expires_at: i64,
}

#[derive(Debug, Serialize)]
pub struct ValidResponse {
    pub valid: bool,
}

#[derive(Debug, Serialize)]
pub struct LinksResponse {
    pub name: String,
    pub username: String,
    pub links: Vec<StoredLink>,
}
