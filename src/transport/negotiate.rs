//! Stream negotiation shared by the transports: SASL PLAIN and resource binding.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{AuthenticationError, ConnectionError};
use crate::jid::Jid;
use crate::namespace as ns;
use crate::stanza::{iq, Element};

/// Mechanism names offered in `<stream:features/>`.
pub fn mechanisms(features: &Element) -> Vec<String> {
    features
        .find("mechanisms", Some(ns::SASL))
        .map(|m| m.find_all("mechanism").map(Element::text_content).collect())
        .unwrap_or_default()
}

pub fn offers_starttls(features: &Element) -> bool {
    features.has_child("starttls", Some(ns::TLS))
}

pub fn offers_bind(features: &Element) -> bool {
    features.has_child("bind", Some(ns::BIND))
}

/// Legacy session establishment is only needed when offered and not marked optional.
pub fn requires_session(features: &Element) -> bool {
    features
        .find("session", Some(ns::SESSION))
        .is_some_and(|s| !s.has_child("optional", None))
}

/// `<auth mechanism="PLAIN">` with base64(`\0node\0password`).
pub fn plain_auth(jid: &Jid, password: &str) -> Result<Element, AuthenticationError> {
    let Some(node) = jid.node() else {
        return Err(AuthenticationError::new("address has no local part"));
    };
    let mut payload = Vec::with_capacity(node.len() + password.len() + 2);
    payload.push(0);
    payload.extend_from_slice(node.as_bytes());
    payload.push(0);
    payload.extend_from_slice(password.as_bytes());

    Ok(Element::with_ns("auth", ns::SASL)
        .attr("mechanism", "PLAIN")
        .text(BASE64.encode(payload)))
}

/// Pick PLAIN from the offered mechanisms and build the auth element.
pub fn start_auth(features: &Element, jid: &Jid, password: &str) -> Result<Element, AuthenticationError> {
    let offered = mechanisms(features);
    if !offered.iter().any(|m| m == "PLAIN") {
        return Err(AuthenticationError::new(format!(
            "no supported SASL mechanism (server offers: {})",
            offered.join(", ")
        )));
    }
    plain_auth(jid, password)
}

/// Interpret the server's answer to `<auth/>`.
pub fn auth_outcome(response: &Element) -> Result<(), AuthenticationError> {
    match response.local_name() {
        "success" => Ok(()),
        "failure" => {
            let condition = response
                .children()
                .find(|c| c.local_name() != "text")
                .map(|c| c.local_name().to_string())
                .unwrap_or_else(|| "not-authorized".to_string());
            Err(AuthenticationError::new(condition))
        }
        other => Err(AuthenticationError::new(format!("unexpected <{}/> during authentication", other))),
    }
}

pub fn bind_request(id: &str, resource: Option<&str>) -> Element {
    let mut bind = Element::with_ns("bind", ns::BIND);
    if let Some(resource) = resource {
        bind.append(Element::new("resource").text(resource));
    }
    iq("set").attr("id", id).child(bind)
}

/// Full address from a bind result.
pub fn bound_jid(response: &Element) -> Result<Jid, ConnectionError> {
    if response.get_attr("type") == Some("error") {
        return Err(ConnectionError::new(stanza_error_condition(response)));
    }
    let jid = response
        .find("bind", Some(ns::BIND))
        .and_then(|b| b.child_text("jid"))
        .ok_or_else(|| ConnectionError::new("bind result without jid"))?;
    Jid::parse(&jid).map_err(|e| ConnectionError::new(e.to_string()))
}

pub fn session_request(id: &str) -> Element {
    iq("set").attr("id", id).child(Element::with_ns("session", ns::SESSION))
}

/// Defined condition of an `<error/>` child, or `undefined-condition`.
pub fn stanza_error_condition(stanza: &Element) -> String {
    stanza
        .find("error", None)
        .and_then(|e| e.children().find(|c| c.ns() == Some(ns::STANZAS) && c.local_name() != "text"))
        .map(|c| c.local_name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string())
}
