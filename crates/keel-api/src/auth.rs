use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};

use keel_types::api::{Claims, SessionRequest, SessionResponse};

use crate::AppState;

/// Issue a session token binding a wallet address to this server. Proving
/// control of the wallet (signature challenge UX) happens upstream; this
/// layer only normalizes and encodes the identity.
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<SessionRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let address = normalize_address(&req.address).ok_or(StatusCode::BAD_REQUEST)?;

    let display_name = match req.display_name {
        Some(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => short_address(&address),
    };

    let token = create_token(&state.jwt_secret, &address, &display_name)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse { address, token }),
    ))
}

pub fn create_token(secret: &str, address: &str, display_name: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: address.to_string(),
        display_name: display_name.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

/// Addresses are opaque beyond shape and case: 0x-prefixed, 40 hex chars,
/// compared lowercased everywhere.
pub fn normalize_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let hex_part = trimmed.strip_prefix("0x")?;
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

fn short_address(address: &str) -> String {
    // 0x1234…abcd
    format!("{}…{}", &address[..6], &address[address.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_normalization() {
        let addr = "0xABCDabcd111122223333444455556666777788Aa";
        assert_eq!(
            normalize_address(addr).unwrap(),
            "0xabcdabcd111122223333444455556666777788aa"
        );

        assert!(normalize_address("not-an-address").is_none());
        assert!(normalize_address("0x1234").is_none());
        assert!(normalize_address("0xzzzzabcd111122223333444455556666777788aa").is_none());
    }

    #[test]
    fn short_address_elides_middle() {
        assert_eq!(
            short_address("0xabcdabcd111122223333444455556666777788aa"),
            "0xabcd…88aa"
        );
    }
}
