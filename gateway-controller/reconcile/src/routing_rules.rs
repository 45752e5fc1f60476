//! Translation of HTTPRoute matches into OCI routing-rule conditions.
//!
//! OCI rules support path prefix/exact and exact header matching. Anything
//! else is rejected so that a route never matches more than it declares.

use oke_gateway_controller_k8s_api::gateway::{
    HeaderMatchType, HttpHeaderMatch, HttpPathMatch, HttpRouteMatch, PathMatchType,
};

const MATCH_ALL: &str = "http.request.url.path sw '/'";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unsupported match: {0}")]
pub struct UnsupportedMatch(String);

/// Builds the condition of a rule from the route's hostnames and the rule's
/// matches.
pub fn rule_condition(
    hostnames: &[String],
    matches: &[HttpRouteMatch],
) -> Result<String, UnsupportedMatch> {
    let matches = if matches.is_empty() {
        vec![MATCH_ALL.to_string()]
    } else {
        matches
            .iter()
            .map(match_condition)
            .collect::<Result<Vec<_>, _>>()?
    };
    let matches = format!("any({})", matches.join(", "));

    if hostnames.is_empty() {
        return Ok(matches);
    }
    let hosts = hostnames
        .iter()
        .map(|h| Ok(format!("http.request.headers[(i 'host')] eq {}", quote(h)?)))
        .collect::<Result<Vec<_>, UnsupportedMatch>>()?;
    Ok(format!("all(any({}), {matches})", hosts.join(", ")))
}

/// The condition that matches every request.
pub fn catch_all_condition() -> String {
    format!("any({MATCH_ALL})")
}

/// Translates a single match. All of its parts must hold.
pub fn match_condition(m: &HttpRouteMatch) -> Result<String, UnsupportedMatch> {
    if !m.query_params.is_empty() {
        return Err(UnsupportedMatch("query parameter matching".to_string()));
    }
    if m.method.is_some() {
        return Err(UnsupportedMatch("method matching".to_string()));
    }

    let mut conditions = Vec::with_capacity(1 + m.headers.len());
    if let Some(path) = m.path.as_ref() {
        conditions.push(path_condition(path)?);
    }
    for header in &m.headers {
        conditions.push(header_condition(header)?);
    }

    Ok(match conditions.len() {
        0 => MATCH_ALL.to_string(),
        1 => conditions.remove(0),
        _ => format!("all({})", conditions.join(", ")),
    })
}

fn path_condition(path: &HttpPathMatch) -> Result<String, UnsupportedMatch> {
    let value = quote(path.value.as_deref().unwrap_or("/"))?;
    match path.type_.unwrap_or(PathMatchType::PathPrefix) {
        PathMatchType::Exact => Ok(format!("http.request.url.path eq {value}")),
        PathMatchType::PathPrefix => Ok(format!("http.request.url.path sw {value}")),
        PathMatchType::RegularExpression => {
            Err(UnsupportedMatch("regular expression path matching".to_string()))
        }
    }
}

fn header_condition(header: &HttpHeaderMatch) -> Result<String, UnsupportedMatch> {
    match header.type_.unwrap_or(HeaderMatchType::Exact) {
        HeaderMatchType::Exact => Ok(format!(
            "http.request.headers[(i {})] eq {}",
            quote(&header.name)?,
            quote(&header.value)?
        )),
        HeaderMatchType::RegularExpression => Err(UnsupportedMatch(format!(
            "regular expression matching of header {}",
            header.name
        ))),
    }
}

// The condition language has no escape for quotes.
fn quote(value: &str) -> Result<String, UnsupportedMatch> {
    if value.contains('\'') {
        return Err(UnsupportedMatch(format!("quote in value {value:?}")));
    }
    Ok(format!("'{value}'"))
}
