use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::users::repo::User;

/// Request body for sign-up. Fields are optional so missing ones fail with
/// the envelope's 400 instead of an extractor rejection.
#[derive(Debug, Deserialize)]
pub struct SignUpRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email_address: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub email_address: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email_address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyForgotPasswordCodeRequest {
    pub email_address: Option<String>,
    pub verification_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct VerifySignInCodeRequest {
    pub email_address: Option<String>,
    pub sign_in_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordQuery {
    pub reset_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub new_password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: Option<String>,
    pub new_password: Option<String>,
}

/// Profile fields from the multipart update. `None` leaves the stored value
/// unchanged.
#[derive(Debug, Default)]
pub struct ProfileChanges {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub user_name: Option<String>,
    pub email_address: Option<String>,
    pub user_bio: Option<String>,
    pub user_preference: Option<Vec<String>>,
}

/// Remote media descriptor as returned by the hosting provider.
#[derive(Debug, Clone, Serialize)]
pub struct Avatar {
    pub url: String,
    pub format: String,
    pub asset_id: String,
    /// Provider key used for later deletion.
    pub public_id: String,
}

/// Outward view of a user: everything except the password hash and the
/// transient code/token slots.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub full_name: Option<String>,
    pub user_name: Option<String>,
    pub email_address: String,
    pub user_bio: Option<String>,
    pub user_preference: Vec<String>,
    pub avatar: Option<Avatar>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<User> for PublicUser {
    fn from(user: User) -> Self {
        let avatar = match (
            user.avatar_url,
            user.avatar_format,
            user.avatar_asset_id,
            user.avatar_public_id,
        ) {
            (Some(url), format, asset_id, public_id) => Some(Avatar {
                url,
                format: format.unwrap_or_default(),
                asset_id: asset_id.unwrap_or_default(),
                public_id: public_id.unwrap_or_default(),
            }),
            _ => None,
        };
        Self {
            id: user.id,
            first_name: user.first_name,
            last_name: user.last_name,
            full_name: user.full_name,
            user_name: user.user_name,
            email_address: user.email_address,
            user_bio: user.user_bio,
            user_preference: user.user_preference,
            avatar,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

/// Body payload for endpoints that issue a session.
#[derive(Debug, Serialize)]
pub struct SessionData {
    pub access_token: String,
    pub user: PublicUser,
}

#[derive(Debug, Serialize)]
pub struct UserData {
    pub user: PublicUser,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn sample_user() -> User {
        User {
            id: Uuid::new_v4(),
            first_name: "Grace".into(),
            last_name: "Hopper".into(),
            full_name: Some("Grace Hopper".into()),
            user_name: Some("ghopper".into()),
            email_address: "grace@example.com".into(),
            user_bio: None,
            user_preference: vec!["dark-mode".into()],
            password_hash: "hash".into(),
            avatar_url: Some("https://cdn.example.com/a.png".into()),
            avatar_format: Some("png".into()),
            avatar_asset_id: Some("asset".into()),
            avatar_public_id: Some("avatars/x/asset.png".into()),
            verification_code: Some(111111),
            verification_code_expires_at: None,
            sign_in_code: None,
            sign_in_code_expires_at: None,
            reset_token: Some("tok".into()),
            reset_token_expires_at: None,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn public_view_strips_secrets_and_keeps_avatar() {
        let view = PublicUser::from(sample_user());
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["email_address"], "grace@example.com");
        assert_eq!(json["avatar"]["url"], "https://cdn.example.com/a.png");
        assert!(json.get("password_hash").is_none());
        assert!(json.get("verification_code").is_none());
        assert!(json.get("reset_token").is_none());
    }

    #[test]
    fn public_view_without_avatar_is_null() {
        let mut user = sample_user();
        user.avatar_url = None;
        let view = PublicUser::from(user);
        let json = serde_json::to_value(&view).unwrap();
        assert!(json["avatar"].is_null());
    }
}
