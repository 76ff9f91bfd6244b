use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::CookieJar;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        jwt::AuthUser,
        password::{hash_password, verify_password},
        session::removal_cookie,
    },
    error::ApiError,
    response::{respond, respond_empty},
    state::AppState,
    users::{
        dto::{
            ChangePasswordRequest, EmailRequest, ProfileChanges, ResetPasswordQuery,
            ResetPasswordRequest, SignInRequest, SignUpRequest, UserData,
            VerifyForgotPasswordCodeRequest, VerifySignInCodeRequest,
        },
        repo::{CodeKind, User},
        services::{self, is_valid_email, AvatarUpload},
    },
};

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/user/sign-up", post(sign_up))
        .route("/user/sign-in", post(sign_in))
        .route("/user/forgot-password", post(forgot_password))
        .route("/user/sign-in-code", post(send_sign_in_code))
        .route(
            "/user/verify-forgot-password-code",
            post(verify_forgot_password_code),
        )
        .route("/user/verify-sign-in-code", post(verify_sign_in_code))
        .route("/user/reset-password", post(reset_password))
        .route("/user/get-user", get(get_user))
        .route("/user/change-password", post(change_password))
        .route("/user/update-user", post(update_user))
        .route("/user/logout", get(logout))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

fn require<T>(value: Option<T>) -> Result<T, ApiError> {
    value.ok_or_else(|| ApiError::Validation("Please provide all required fields.".into()))
}

fn normalize_email(raw: &str) -> Result<String, ApiError> {
    let email = raw.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(ApiError::Validation("Invalid email".into()));
    }
    Ok(email)
}

#[instrument(skip(state, jar, payload))]
async fn sign_up(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<SignUpRequest>,
) -> Result<Response, ApiError> {
    let first_name = require(payload.first_name)?;
    let last_name = require(payload.last_name)?;
    let email = normalize_email(&require(payload.email_address)?)?;
    let password = require(payload.password)?;

    if password.len() < 8 {
        return Err(ApiError::Validation("Password too short".into()));
    }

    if User::find_by_email(&state.db, &email).await?.is_some() {
        warn!(email = %email, "sign-up with registered email");
        return Err(ApiError::EmailAlreadyExists);
    }

    let hash = hash_password(&password)?;
    let user = User::create(&state.db, &first_name, &last_name, &email, &hash).await?;
    info!(user_id = %user.id, email = %user.email_address, "user registered");

    let (cookie, session) = services::issue_session(&state, user)?;
    Ok((
        jar.add(cookie),
        respond(
            StatusCode::CREATED,
            "User created successfully",
            Some(session),
        ),
    )
        .into_response())
}

#[instrument(skip(state, jar, payload))]
async fn sign_in(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<SignInRequest>,
) -> Result<Response, ApiError> {
    let email = normalize_email(&require(payload.email_address)?)?;
    let password = require(payload.password)?;

    let user = User::find_by_email(&state.db, &email)
        .await?
        .ok_or(ApiError::InvalidCredentials)?;

    if !verify_password(&password, &user.password_hash)? {
        warn!(user_id = %user.id, "sign-in with invalid password");
        return Err(ApiError::InvalidCredentials);
    }

    info!(user_id = %user.id, "user signed in");
    let (cookie, session) = services::issue_session(&state, user)?;
    Ok((
        jar.add(cookie),
        respond(StatusCode::OK, "User login successful", Some(session)),
    )
        .into_response())
}

#[instrument(skip(state, payload))]
async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<EmailRequest>,
) -> Result<Response, ApiError> {
    let email = normalize_email(&require(payload.email_address)?)?;
    services::issue_code(&state, &email, CodeKind::PasswordReset).await?;
    Ok(respond_empty(
        StatusCode::OK,
        "Verification code sent successfully",
    ))
}

#[instrument(skip(state, payload))]
async fn send_sign_in_code(
    State(state): State<AppState>,
    Json(payload): Json<EmailRequest>,
) -> Result<Response, ApiError> {
    let email = normalize_email(&require(payload.email_address)?)?;
    services::issue_code(&state, &email, CodeKind::SignIn).await?;
    Ok(respond_empty(StatusCode::OK, "Sign in code sent successfully"))
}

#[instrument(skip(state, payload))]
async fn verify_forgot_password_code(
    State(state): State<AppState>,
    Json(payload): Json<VerifyForgotPasswordCodeRequest>,
) -> Result<Response, ApiError> {
    let email = normalize_email(&require(payload.email_address)?)?;
    let code = require(payload.verification_code)?;
    services::verify_forgot_password_code(&state, &email, code).await?;
    Ok(respond_empty(
        StatusCode::OK,
        "Reset password link sent successfully",
    ))
}

#[instrument(skip(state, jar, payload))]
async fn verify_sign_in_code(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<VerifySignInCodeRequest>,
) -> Result<Response, ApiError> {
    let email = normalize_email(&require(payload.email_address)?)?;
    let code = require(payload.sign_in_code)?;

    let user = services::verify_sign_in_code(&state, &email, code).await?;
    info!(user_id = %user.id, "user signed in with code");

    let (cookie, session) = services::issue_session(&state, user)?;
    Ok((
        jar.add(cookie),
        respond(StatusCode::OK, "User login successful", Some(session)),
    )
        .into_response())
}

#[instrument(skip(state, query, payload))]
async fn reset_password(
    State(state): State<AppState>,
    Query(query): Query<ResetPasswordQuery>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Response, ApiError> {
    let token = require(query.reset_token)?;
    let new_password = require(payload.new_password)?;
    services::reset_password(&state, &token, &new_password).await?;
    Ok(respond_empty(StatusCode::OK, "Password updated successfully."))
}

#[instrument(skip(state))]
async fn get_user(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Response, ApiError> {
    let user = User::find_by_id(&state.db, user_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(respond(
        StatusCode::OK,
        "User fetched successfully",
        Some(UserData { user: user.into() }),
    ))
}

#[instrument(skip(state, payload))]
async fn change_password(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Response, ApiError> {
    let current_password = require(payload.current_password)?;
    let new_password = require(payload.new_password)?;
    services::change_password(&state, user_id, &current_password, &new_password).await?;
    info!(user_id = %user_id, "password changed");
    Ok(respond_empty(StatusCode::OK, "Password changed successfully"))
}

/// Multipart form: profile text fields plus an optional `avatar` file.
#[instrument(skip(state, multipart))]
async fn update_user(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut changes = ProfileChanges::default();
    let mut upload: Option<AvatarUpload> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::Validation("Malformed multipart body.".into()))?
    {
        let Some(name) = field.name().map(|s| s.to_string()) else {
            continue;
        };
        match name.as_str() {
            "avatar" => {
                let content_type = field
                    .content_type()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "application/octet-stream".into());
                let data = field
                    .bytes()
                    .await
                    .map_err(|_| ApiError::Validation("Invalid file upload.".into()))?;
                if !data.is_empty() {
                    upload = Some(AvatarUpload {
                        body: data,
                        content_type,
                    });
                }
            }
            "first_name" => changes.first_name = Some(text_field(field).await?),
            "last_name" => changes.last_name = Some(text_field(field).await?),
            "user_name" => changes.user_name = Some(text_field(field).await?),
            "email_address" => {
                changes.email_address = Some(normalize_email(&text_field(field).await?)?)
            }
            "user_bio" => changes.user_bio = Some(text_field(field).await?),
            "user_preference" => changes
                .user_preference
                .get_or_insert_with(Vec::new)
                .push(text_field(field).await?),
            _ => {}
        }
    }

    let updated = services::update_profile(&state, user_id, changes, upload).await?;
    info!(user_id = %user_id, "user details updated");
    Ok(respond(
        StatusCode::OK,
        "User details updated successfully",
        Some(UserData {
            user: updated.into(),
        }),
    ))
}

async fn text_field(field: Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|_| ApiError::Validation("Malformed multipart field.".into()))
}

#[instrument(skip_all)]
async fn logout(AuthUser(user_id): AuthUser, jar: CookieJar) -> Result<Response, ApiError> {
    info!(user_id = %user_id, "user logged out");
    Ok((
        jar.add(removal_cookie()),
        respond_empty(StatusCode::OK, "User logout successful"),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_rejects_missing_fields() {
        let err = require::<String>(None).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(require(Some(1)).unwrap(), 1);
    }

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(
            normalize_email("  A@X.Com ").unwrap(),
            "a@x.com".to_string()
        );
        assert!(normalize_email("nope").is_err());
    }
}
