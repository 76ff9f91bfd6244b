use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::users::dto::{Avatar, ProfileChanges};

/// Full persisted record. The password hash and the three one-time flow
/// slots never serialize; responses go through `PublicUser` anyway.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub full_name: Option<String>,
    pub user_name: Option<String>,
    pub email_address: String,
    pub user_bio: Option<String>,
    pub user_preference: Vec<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub avatar_url: Option<String>,
    pub avatar_format: Option<String>,
    pub avatar_asset_id: Option<String>,
    pub avatar_public_id: Option<String>,
    #[serde(skip_serializing)]
    pub verification_code: Option<i32>,
    #[serde(skip_serializing)]
    pub verification_code_expires_at: Option<OffsetDateTime>,
    #[serde(skip_serializing)]
    pub sign_in_code: Option<i32>,
    #[serde(skip_serializing)]
    pub sign_in_code_expires_at: Option<OffsetDateTime>,
    #[serde(skip_serializing)]
    pub reset_token: Option<String>,
    #[serde(skip_serializing)]
    pub reset_token_expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// The two OTP flow slots. Each maps to its own code/expiry column pair so
/// the flows stay independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    PasswordReset,
    SignIn,
}

impl CodeKind {
    fn columns(self) -> (&'static str, &'static str) {
        match self {
            CodeKind::PasswordReset => ("verification_code", "verification_code_expires_at"),
            CodeKind::SignIn => ("sign_in_code", "sign_in_code_expires_at"),
        }
    }
}

const USER_COLUMNS: &str = "id, first_name, last_name, full_name, user_name, email_address, \
     user_bio, user_preference, password_hash, avatar_url, avatar_format, avatar_asset_id, \
     avatar_public_id, verification_code, verification_code_expires_at, sign_in_code, \
     sign_in_code_expires_at, reset_token, reset_token_expires_at, created_at, updated_at";

/// Check-and-clear in one statement: the WHERE guards on the current code
/// value and a live expiry, the SET nulls the slot. Row-level atomicity in
/// Postgres means at most one concurrent submission can match.
fn take_code_sql(kind: CodeKind) -> String {
    let (code_col, expiry_col) = kind.columns();
    format!(
        "UPDATE users SET {code_col} = NULL, {expiry_col} = NULL, updated_at = now() \
         WHERE email_address = $1 AND {code_col} = $2 AND {expiry_col} > now() \
         RETURNING {USER_COLUMNS}"
    )
}

/// Guarding on the stored token makes consumption one-time: a replayed
/// token matches zero rows once the slot is cleared.
const CONSUME_RESET_TOKEN_SQL: &str =
    "UPDATE users SET password_hash = $3, reset_token = NULL, \
     reset_token_expires_at = NULL, updated_at = now() \
     WHERE id = $1 AND reset_token = $2";

/// The avatar columns only appear when a new descriptor is supplied, so a
/// metadata-only update cannot clear a stored avatar.
fn update_profile_sql(with_avatar: bool) -> String {
    let avatar_set = if with_avatar {
        "avatar_url = $8, avatar_format = $9, avatar_asset_id = $10, avatar_public_id = $11, "
    } else {
        ""
    };
    format!(
        "UPDATE users SET \
         first_name = COALESCE($2, first_name), \
         last_name = COALESCE($3, last_name), \
         full_name = COALESCE($2, first_name) || ' ' || COALESCE($3, last_name), \
         user_name = COALESCE($4, user_name), \
         email_address = COALESCE($5, email_address), \
         user_bio = COALESCE($6, user_bio), \
         user_preference = COALESCE($7, user_preference), \
         {avatar_set}updated_at = now() \
         WHERE id = $1 RETURNING {USER_COLUMNS}"
    )
}

impl User {
    pub async fn find_by_email(db: &PgPool, email: &str) -> Result<Option<User>, sqlx::Error> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email_address = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(db)
            .await?;
        Ok(user)
    }

    pub async fn find_by_id(db: &PgPool, id: Uuid) -> Result<Option<User>, sqlx::Error> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(db)
            .await?;
        Ok(user)
    }

    pub async fn create(
        db: &PgPool,
        first_name: &str,
        last_name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<User, sqlx::Error> {
        let sql = format!(
            "INSERT INTO users (first_name, last_name, full_name, email_address, password_hash) \
             VALUES ($1, $2, $1 || ' ' || $2, $3, $4) \
             RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(first_name)
            .bind(last_name)
            .bind(email)
            .bind(password_hash)
            .fetch_one(db)
            .await?;
        Ok(user)
    }

    /// Store a freshly issued code on its slot. Only called after the mail
    /// provider confirmed the send.
    pub async fn set_code(
        db: &PgPool,
        email: &str,
        kind: CodeKind,
        code: i32,
        expires_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        let (code_col, expiry_col) = kind.columns();
        let sql = format!(
            "UPDATE users SET {code_col} = $2, {expiry_col} = $3, updated_at = now() \
             WHERE email_address = $1"
        );
        sqlx::query(&sql)
            .bind(email)
            .bind(code)
            .bind(expires_at)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Atomic check-and-clear: the code is accepted and invalidated in one
    /// conditional UPDATE, so two concurrent submissions of the same valid
    /// code cannot both succeed. Returns the owning record on success.
    pub async fn take_code(
        db: &PgPool,
        email: &str,
        kind: CodeKind,
        code: i32,
    ) -> Result<Option<User>, sqlx::Error> {
        let sql = take_code_sql(kind);
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .bind(code)
            .fetch_optional(db)
            .await?;
        Ok(user)
    }

    /// Bookkeeping copy of the signed reset token; consumption only uses it
    /// as the one-time latch.
    pub async fn set_reset_token(
        db: &PgPool,
        email: &str,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE users SET reset_token = $2, reset_token_expires_at = $3, updated_at = now() \
             WHERE email_address = $1",
        )
        .bind(email)
        .bind(token)
        .bind(expires_at)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Replace the password hash and clear the reset slot in one conditional
    /// UPDATE. Zero rows means the token was already consumed (or never
    /// stored); the caller treats that as invalid.
    pub async fn consume_reset_token(
        db: &PgPool,
        user_id: Uuid,
        token: &str,
        new_password_hash: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(CONSUME_RESET_TOKEN_SQL)
            .bind(user_id)
            .bind(token)
            .bind(new_password_hash)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_password(
        db: &PgPool,
        user_id: Uuid,
        new_password_hash: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
            .bind(user_id)
            .bind(new_password_hash)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Merge-style profile update: absent fields keep their stored values.
    /// The avatar descriptor is only touched when a new one is supplied; a
    /// metadata-only update never clears it.
    pub async fn update_profile(
        db: &PgPool,
        user_id: Uuid,
        changes: &ProfileChanges,
        avatar: Option<&Avatar>,
    ) -> Result<Option<User>, sqlx::Error> {
        let sql = update_profile_sql(avatar.is_some());
        let user = match avatar {
            Some(avatar) => {
                sqlx::query_as::<_, User>(&sql)
                    .bind(user_id)
                    .bind(&changes.first_name)
                    .bind(&changes.last_name)
                    .bind(&changes.user_name)
                    .bind(&changes.email_address)
                    .bind(&changes.user_bio)
                    .bind(&changes.user_preference)
                    .bind(&avatar.url)
                    .bind(&avatar.format)
                    .bind(&avatar.asset_id)
                    .bind(&avatar.public_id)
                    .fetch_optional(db)
                    .await?
            }
            None => {
                sqlx::query_as::<_, User>(&sql)
                    .bind(user_id)
                    .bind(&changes.first_name)
                    .bind(&changes.last_name)
                    .bind(&changes.user_name)
                    .bind(&changes.email_address)
                    .bind(&changes.user_bio)
                    .bind(&changes.user_preference)
                    .fetch_optional(db)
                    .await?
            }
        };
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_code_checks_and_clears_in_one_statement() {
        // A code is accepted once: the same UPDATE that matches the current
        // value nulls the slot, so a second submission (or a concurrent one
        // losing the row lock race) matches zero rows.
        let sql = take_code_sql(CodeKind::PasswordReset);
        assert!(sql.starts_with("UPDATE users SET verification_code = NULL"));
        assert!(sql.contains("verification_code_expires_at = NULL"));
        assert!(sql.contains("WHERE email_address = $1 AND verification_code = $2"));
        assert!(sql.contains("verification_code_expires_at > now()"));

        let sql = take_code_sql(CodeKind::SignIn);
        assert!(sql.starts_with("UPDATE users SET sign_in_code = NULL"));
        assert!(sql.contains("WHERE email_address = $1 AND sign_in_code = $2"));
        assert!(sql.contains("sign_in_code_expires_at > now()"));
    }

    #[test]
    fn expired_codes_cannot_match_even_when_equal() {
        // The expiry guard lives in the same WHERE clause as the value
        // check; there is no path that accepts a correct-but-stale code.
        for kind in [CodeKind::PasswordReset, CodeKind::SignIn] {
            let sql = take_code_sql(kind);
            let (_, expiry_col) = kind.columns();
            let where_clause = sql.split("WHERE").nth(1).expect("WHERE clause");
            assert!(where_clause.contains(&format!("{expiry_col} > now()")));
        }
    }

    #[test]
    fn reset_token_consumption_clears_the_latch() {
        // Replay protection: password swap and token clear happen in one
        // conditional UPDATE keyed on the stored token.
        assert!(CONSUME_RESET_TOKEN_SQL.contains("password_hash = $3"));
        assert!(CONSUME_RESET_TOKEN_SQL.contains("reset_token = NULL"));
        assert!(CONSUME_RESET_TOKEN_SQL.contains("reset_token_expires_at = NULL"));
        assert!(CONSUME_RESET_TOKEN_SQL.contains("WHERE id = $1 AND reset_token = $2"));
    }

    #[test]
    fn metadata_only_update_never_touches_avatar_columns() {
        let sql = update_profile_sql(false);
        assert!(!sql.contains("avatar_"));
        assert!(sql.contains("first_name = COALESCE($2, first_name)"));

        let sql = update_profile_sql(true);
        assert!(sql.contains("avatar_url = $8"));
        assert!(sql.contains("avatar_format = $9"));
        assert!(sql.contains("avatar_asset_id = $10"));
        assert!(sql.contains("avatar_public_id = $11"));
    }

    #[test]
    fn code_kinds_map_to_independent_slots() {
        let (reset_code, reset_expiry) = CodeKind::PasswordReset.columns();
        let (signin_code, signin_expiry) = CodeKind::SignIn.columns();
        assert_eq!(reset_code, "verification_code");
        assert_eq!(signin_code, "sign_in_code");
        assert_ne!(reset_code, signin_code);
        assert_ne!(reset_expiry, signin_expiry);
    }

    #[test]
    fn secrets_never_serialize() {
        let fixed = time::macros::datetime!(2024-01-01 0:00 UTC);
        let user = User {
            id: Uuid::new_v4(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            full_name: Some("Ada Lovelace".into()),
            user_name: None,
            email_address: "ada@example.com".into(),
            user_bio: None,
            user_preference: vec![],
            password_hash: "argon2-hash".into(),
            avatar_url: None,
            avatar_format: None,
            avatar_asset_id: None,
            avatar_public_id: None,
            verification_code: Some(123456),
            verification_code_expires_at: Some(fixed),
            sign_in_code: Some(654321),
            sign_in_code_expires_at: None,
            reset_token: Some("signed-token".into()),
            reset_token_expires_at: None,
            created_at: fixed,
            updated_at: fixed,
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("argon2-hash"));
        assert!(!json.contains("password_hash"));
        assert!(!json.contains("123456"));
        assert!(!json.contains("654321"));
        assert!(!json.contains("signed-token"));
        assert!(json.contains("ada@example.com"));
    }
}
