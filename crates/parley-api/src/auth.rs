use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header, encode};
use rand::Rng;
use tracing::info;
use uuid::Uuid;

use parley_db::models::parse_timestamp;
use parley_types::api::{
    Claims, EmailRequest, LoginRequest, LoginResponse, ResetPasswordRequest, SignupRequest, StatusResponse,
    StatusUpdateRequest, UpdateProfileRequest, VerifyOtpRequest,
};

use crate::error::{ApiError, ApiResult};
use crate::extract::ApiJson;
use crate::{AppState, blocking};

/// How long an emailed verification code stays valid, and how long a
/// verified code allows a password reset.
const OTP_VALIDITY_MINUTES: i64 = 10;

fn hash_password(password: &str) -> ApiResult<String> {
    if password.is_empty() {
        return Err(ApiError::BadRequest("password must not be empty".into()));
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(format!("password hashing failed: {}", e)))?
        .to_string())
}

pub async fn signup(State(state): State<AppState>, ApiJson(req): ApiJson<SignupRequest>) -> ApiResult<impl IntoResponse> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".into()));
    }
    if !req.email.contains('@') {
        return Err(ApiError::BadRequest("email is not valid".into()));
    }
    let password_hash = hash_password(&req.password)?;

    let db = state.db.clone();
    let user_id = Uuid::new_v4();
    let email = req.email.clone();
    blocking(move || db.create_user(&user_id.to_string(), &req.name, &req.email, &password_hash)).await?;

    info!("Registered {}", email);
    Ok((StatusCode::CREATED, Json(StatusResponse::new("User registered successfully"))))
}

pub async fn login(State(state): State<AppState>, ApiJson(req): ApiJson<LoginRequest>) -> ApiResult<Json<LoginResponse>> {
    let db = state.db.clone();
    let email = req.email.clone();
    let user = blocking(move || db.get_user_by_email(&email))
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;

    if !user.active {
        return Err(ApiError::Forbidden("User is deactivated".into()));
    }

    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| ApiError::Internal(format!("stored hash for {} unreadable: {}", user.email, e)))?;
    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthorized("Invalid credentials".into()))?;

    let user_id: Uuid = user
        .id
        .parse()
        .map_err(|e| ApiError::Internal(format!("corrupt user id '{}': {}", user.id, e)))?;

    let token = create_token(&state.jwt_secret, user_id, &user.email, state.token_ttl)?;

    Ok(Json(LoginResponse {
        user_id,
        name: user.name,
        email: user.email,
        email_verified: user.email_verified,
        token,
    }))
}

/// Issue a 6-digit verification code. Delivery is simulated through the log.
pub async fn send_otp(State(state): State<AppState>, ApiJson(req): ApiJson<EmailRequest>) -> ApiResult<Json<StatusResponse>> {
    let otp = rand::rng().random_range(100_000..1_000_000).to_string();

    let db = state.db.clone();
    let email = req.email.clone();
    let code = otp.clone();
    blocking(move || db.set_email_otp(&email, &code, Utc::now())).await?;

    info!("Simulated OTP for {}: {}", req.email, otp);
    Ok(Json(StatusResponse::new("OTP sent successfully (check logs)")))
}

pub async fn verify_otp(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<VerifyOtpRequest>,
) -> ApiResult<Json<StatusResponse>> {
    let db = state.db.clone();
    let email = req.email.clone();
    let user = blocking(move || db.get_user_by_email(&email))
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;

    if user.email_otp.as_deref() != Some(req.otp.as_str()) {
        return Err(ApiError::BadRequest("Invalid OTP".into()));
    }

    let issued_at = user
        .otp_generated_at
        .as_deref()
        .and_then(parse_timestamp)
        .ok_or_else(|| ApiError::Internal(format!("OTP for {} has no issue time", user.email)))?;
    if Utc::now() - issued_at > chrono::Duration::minutes(OTP_VALIDITY_MINUTES) {
        return Err(ApiError::Gone("OTP expired".into()));
    }

    let db = state.db.clone();
    blocking(move || db.mark_email_verified(&user.email)).await?;

    Ok(Json(StatusResponse::new("Email verified successfully")))
}

/// Activate or deactivate the caller's own account.
pub async fn update_status(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<StatusUpdateRequest>,
) -> ApiResult<Json<StatusResponse>> {
    let db = state.db.clone();
    let email = claims.sub.clone();
    blocking(move || db.set_user_active(&email, req.active)).await?;

    let status = if req.active { "activated" } else { "deactivated" };
    info!("{} {}", claims.sub, status);
    Ok(Json(StatusResponse::new(format!("User {} successfully", status))))
}

/// Rename the caller and optionally change their password.
pub async fn update_profile(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<UpdateProfileRequest>,
) -> ApiResult<Json<StatusResponse>> {
    if req.user_id.is_some_and(|id| id != claims.user_id) {
        return Err(ApiError::Forbidden("Cannot update another user's profile".into()));
    }
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".into()));
    }

    let password_hash = match req.password.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => Some(hash_password(password)?),
        None => None,
    };

    let db = state.db.clone();
    let email = claims.sub.clone();
    blocking(move || db.update_profile(&email, &req.name, password_hash.as_deref())).await?;

    info!("{} updated their profile", claims.sub);
    Ok(Json(StatusResponse::new("User updated successfully")))
}

/// Set a new password after a successful OTP verification.
pub async fn reset_password(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ResetPasswordRequest>,
) -> ApiResult<Json<StatusResponse>> {
    let password_hash = hash_password(&req.new_password)?;

    let db = state.db.clone();
    let email = req.email.clone();
    let window = chrono::Duration::minutes(OTP_VALIDITY_MINUTES);
    blocking(move || db.reset_password(&email, &password_hash, window)).await?;

    info!("Password reset for {}", req.email);
    Ok(Json(StatusResponse::new("Password reset successfully")))
}

pub fn create_token(secret: &str, user_id: Uuid, email: &str, ttl: chrono::Duration) -> ApiResult<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: email.to_string(),
        user_id,
        iat: now.timestamp() as usize,
        exp: (now + ttl).timestamp() as usize,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| ApiError::Internal(format!("token encoding failed: {}", e)))
}
