//! Caller identity from trusted request headers
//!
//! An upstream proxy authenticates callers and forwards who they are in
//! `x-principal-id`, `x-principal-group` and `x-principal-admin`.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::Error;
use crate::access::Principal;

pub const PRINCIPAL_ID_HEADER: &str = "x-principal-id";
pub const PRINCIPAL_GROUP_HEADER: &str = "x-principal-group";
pub const PRINCIPAL_ADMIN_HEADER: &str = "x-principal-admin";

/// Authenticated caller of a request
#[derive(Debug, Clone)]
pub struct Caller(pub Principal);

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_admin(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header(parts, PRINCIPAL_ID_HEADER)
            .ok_or_else(|| Error::Auth(format!("missing {PRINCIPAL_ID_HEADER} header")))?;
        let group = header(parts, PRINCIPAL_GROUP_HEADER)
            .ok_or_else(|| Error::Auth(format!("missing {PRINCIPAL_GROUP_HEADER} header")))?;

        let principal = Principal {
            id: id.to_string(),
            group_id: group.to_string(),
            is_admin: parse_admin(header(parts, PRINCIPAL_ADMIN_HEADER)),
        };
        Ok(Self(principal))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;

    async fn extract(builder: axum::http::request::Builder) -> Result<Caller, Error> {
        let (mut parts, ()) = builder.body(()).unwrap().into_parts();
        Caller::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn reads_principal_headers() {
        let Caller(principal) = extract(
            Request::builder()
                .header(PRINCIPAL_ID_HEADER, "u1")
                .header(PRINCIPAL_GROUP_HEADER, "g1")
                .header(PRINCIPAL_ADMIN_HEADER, "TRUE"),
        )
        .await
        .unwrap();

        assert_eq!(principal.id, "u1");
        assert_eq!(principal.group_id, "g1");
        assert!(principal.is_admin);
    }

    #[tokio::test]
    async fn admin_defaults_to_false() {
        let Caller(principal) = extract(
            Request::builder()
                .header(PRINCIPAL_ID_HEADER, "u1")
                .header(PRINCIPAL_GROUP_HEADER, "g1"),
        )
        .await
        .unwrap();
        assert!(!principal.is_admin);
    }

    #[tokio::test]
    async fn missing_identity_is_unauthenticated() {
        let result = extract(Request::builder().header(PRINCIPAL_ID_HEADER, "u1")).await;
        assert!(matches!(result, Err(Error::Auth(_))));
    }
}
