use axum_extra::extract::cookie::Cookie;
use bytes::Bytes;
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    auth::{
        jwt::JwtKeys,
        password::{hash_password, verify_password},
        session::session_cookie,
    },
    error::ApiError,
    mailer::Mail,
    state::AppState,
    users::{
        dto::{Avatar, ProfileChanges, SessionData},
        repo::{CodeKind, User},
    },
};

/// One-time codes stay valid for 3 hours; checked lazily, never swept.
const CODE_TTL: TimeDuration = TimeDuration::hours(3);

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// 6-digit OTP, uniform over [100000, 999999].
fn generate_code() -> i32 {
    rand::thread_rng().gen_range(100_000..=999_999)
}

/// Issue an OTP for the given flow slot. The code is only persisted after
/// the mail provider confirmed the send; a failed send persists nothing.
pub async fn issue_code(state: &AppState, email: &str, kind: CodeKind) -> Result<(), ApiError> {
    let user = User::find_by_email(&state.db, email)
        .await?
        .ok_or(ApiError::InvalidCredentials)?;

    let code = generate_code();
    let mail = match kind {
        CodeKind::PasswordReset => Mail::VerificationCode(code),
        CodeKind::SignIn => Mail::SignInCode(code),
    };

    let message_id = state
        .mailer
        .send(&user.email_address, mail)
        .await
        .map_err(|e| {
            error!(error = %e, kind = ?kind, "otp email send failed");
            ApiError::DeliveryFailed
        })?;
    debug!(%message_id, kind = ?kind, "otp email accepted by provider");

    let expires_at = OffsetDateTime::now_utc() + CODE_TTL;
    User::set_code(&state.db, &user.email_address, kind, code, expires_at).await?;
    Ok(())
}

/// Consume a password-reset OTP. On success the slot is already cleared
/// (single conditional UPDATE), a signed reset token is stored as the
/// one-time latch and the reset link is emailed to the user.
pub async fn verify_forgot_password_code(
    state: &AppState,
    email: &str,
    code: i32,
) -> Result<(), ApiError> {
    let user = User::take_code(&state.db, email, CodeKind::PasswordReset, code)
        .await?
        .ok_or(ApiError::InvalidOrExpiredCode)?;

    let keys = JwtKeys::from(&state.config.jwt);
    let token = keys.sign_reset(user.id)?;
    let reset_url = format!(
        "{}/?reset_token={}",
        state.config.reset_url_base.trim_end_matches('/'),
        token
    );

    state
        .mailer
        .send(&user.email_address, Mail::ResetLink(reset_url))
        .await
        .map_err(|e| {
            error!(error = %e, "reset link email send failed");
            ApiError::DeliveryFailed
        })?;

    let expires_at =
        OffsetDateTime::now_utc() + TimeDuration::seconds(keys.reset_ttl.as_secs() as i64);
    User::set_reset_token(&state.db, &user.email_address, &token, expires_at).await?;
    Ok(())
}

/// Consume a sign-in OTP; the caller issues the session.
pub async fn verify_sign_in_code(
    state: &AppState,
    email: &str,
    code: i32,
) -> Result<User, ApiError> {
    User::take_code(&state.db, email, CodeKind::SignIn, code)
        .await?
        .ok_or(ApiError::InvalidOrExpiredCode)
}

/// The signed token is authoritative for identity and expiry; the stored
/// copy only guards against replay. Zero rows on the conditional UPDATE
/// means the token was already used.
pub async fn reset_password(
    state: &AppState,
    token: &str,
    new_password: &str,
) -> Result<(), ApiError> {
    let keys = JwtKeys::from(&state.config.jwt);
    let claims = keys
        .verify_reset(token)
        .map_err(|_| ApiError::InvalidOrExpiredCode)?;

    let new_hash = hash_password(new_password)?;
    let consumed = User::consume_reset_token(&state.db, claims.sub, token, &new_hash).await?;
    if !consumed {
        return Err(ApiError::InvalidOrExpiredCode);
    }
    Ok(())
}

pub async fn change_password(
    state: &AppState,
    user_id: Uuid,
    current_password: &str,
    new_password: &str,
) -> Result<(), ApiError> {
    let user = User::find_by_id(&state.db, user_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if !verify_password(current_password, &user.password_hash)? {
        return Err(ApiError::InvalidCredentials);
    }

    let new_hash = hash_password(new_password)?;
    User::update_password(&state.db, user_id, &new_hash).await?;
    Ok(())
}

/// Turn a validated credential into a cookie plus the public payload.
pub fn issue_session(
    state: &AppState,
    user: User,
) -> Result<(Cookie<'static>, SessionData), ApiError> {
    let keys = JwtKeys::from(&state.config.jwt);
    let token = keys.sign_access(user.id)?;
    let cookie = session_cookie(token.clone(), &state.config);
    Ok((
        cookie,
        SessionData {
            access_token: token,
            user: user.into(),
        },
    ))
}

pub struct AvatarUpload {
    pub body: Bytes,
    pub content_type: String,
}

/// Merge profile fields and optionally replace the avatar. The previous
/// remote asset is deleted only after the new upload succeeded and the new
/// descriptor is persisted; without an upload the stored avatar stays.
pub async fn update_profile(
    state: &AppState,
    user_id: Uuid,
    changes: ProfileChanges,
    upload: Option<AvatarUpload>,
) -> Result<User, ApiError> {
    let user = User::find_by_id(&state.db, user_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let previous_key = user.avatar_public_id;

    let avatar = match upload {
        Some(upload) => {
            let ext = ext_from_mime(&upload.content_type).unwrap_or("bin");
            let asset_id = Uuid::new_v4();
            let key = format!("avatars/{}/{}.{}", user_id, asset_id, ext);
            state
                .storage
                .put_object(&key, upload.body, &upload.content_type)
                .await?;
            Some(Avatar {
                url: state.storage.object_url(&key),
                format: ext.to_string(),
                asset_id: asset_id.to_string(),
                public_id: key,
            })
        }
        None => None,
    };

    let updated = User::update_profile(&state.db, user_id, &changes, avatar.as_ref())
        .await?
        .ok_or(ApiError::NotFound)?;

    if avatar.is_some() {
        if let Some(old_key) = previous_key {
            // Replaced asset; losing it is not worth failing the update over.
            if let Err(e) = state.storage.delete_object(&old_key).await {
                warn!(error = %e, key = %old_key, "failed to delete replaced avatar asset");
            }
        }
    }

    Ok(updated)
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_stay_in_the_six_digit_range() {
        for _ in 0..1000 {
            let code = generate_code();
            assert!((100_000..=999_999).contains(&code), "out of range: {code}");
        }
    }

    #[test]
    fn email_validation_accepts_plausible_addresses() {
        assert!(is_valid_email("a@x.com"));
        assert!(is_valid_email("first.last@sub.example.co"));
        assert!(!is_valid_email("not-an-email"));
        assert!(!is_valid_email("missing@tld"));
        assert!(!is_valid_email("spaces in@example.com"));
    }

    #[test]
    fn ext_from_mime_covers_supported_image_types() {
        assert_eq!(ext_from_mime("image/jpeg"), Some("jpg"));
        assert_eq!(ext_from_mime("image/jpg"), Some("jpg"));
        assert_eq!(ext_from_mime("image/png"), Some("png"));
        assert_eq!(ext_from_mime("image/webp"), Some("webp"));
        assert_eq!(ext_from_mime("image/heic"), Some("heic"));
        assert_eq!(ext_from_mime("application/pdf"), None);
    }

    #[tokio::test]
    async fn issued_session_sets_the_access_token_cookie() {
        let state = AppState::fake();
        let user = crate::users::repo::User {
            id: Uuid::new_v4(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            full_name: Some("Ada Lovelace".into()),
            user_name: None,
            email_address: "ada@example.com".into(),
            user_bio: None,
            user_preference: vec![],
            password_hash: "hash".into(),
            avatar_url: None,
            avatar_format: None,
            avatar_asset_id: None,
            avatar_public_id: None,
            verification_code: None,
            verification_code_expires_at: None,
            sign_in_code: None,
            sign_in_code_expires_at: None,
            reset_token: None,
            reset_token_expires_at: None,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        };
        let user_id = user.id;

        let (cookie, session) = issue_session(&state, user).expect("issue session");
        assert_eq!(cookie.name(), crate::auth::session::SESSION_COOKIE);
        assert_eq!(cookie.value(), session.access_token);

        let keys = JwtKeys::from(&state.config.jwt);
        let claims = keys.verify(&session.access_token).expect("verify session");
        assert_eq!(claims.sub, user_id);

        let json = serde_json::to_value(&session).unwrap();
        assert!(json["user"].get("password_hash").is_none());
    }

    #[test]
    fn verify_reset_rejects_garbage_tokens() {
        let keys = JwtKeys::from(&crate::config::JwtConfig {
            secret: "s".into(),
            issuer: "i".into(),
            audience: "a".into(),
            expires_days: 3,
        });
        assert!(keys.verify_reset("garbage").is_err());
    }
}
