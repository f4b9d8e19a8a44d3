use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
};

/// Who is adding a row to the branch queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub user_id: u64,
    pub name: String,
}

impl Requester {
    pub fn anonymous() -> Self {
        Self {
            user_id: 0,
            name: "api".to_string(),
        }
    }
}

/// Axum extractor for the requester, from `X-User-Id` and `X-User-Name`.
///
/// Missing headers give an anonymous requester; a non-numeric user id is rejected.
#[async_trait]
impl<S> FromRequestParts<S> for Requester
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let mut requester = Requester::anonymous();

        if let Some(user_id) = extract_header_value(headers, "x-user-id") {
            requester.user_id = user_id.trim().parse().map_err(|_| StatusCode::BAD_REQUEST)?;
        }
        if let Some(name) = extract_header_value(headers, "x-user-name") {
            requester.name = name;
        }
        Ok(requester)
    }
}

/// Extract header value as string
fn extract_header_value(headers: &HeaderMap, header_name: &str) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}
