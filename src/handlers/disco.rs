//! Service discovery answers and entity capabilities (XEP-0030, XEP-0115).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::account::Account;
use crate::namespace as ns;
use crate::registry::HandlerOutcome;
use crate::stanza::{iq_result_for, Element};

/// What this client advertises: one identity and a feature list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    node: String,
    category: String,
    kind: String,
    name: String,
    features: Vec<String>,
}

impl Capabilities {
    pub fn new(node: impl Into<String>) -> Self {
        let mut caps = Self {
            node: node.into(),
            category: "client".to_string(),
            kind: "pc".to_string(),
            name: "fluux-session".to_string(),
            features: Vec::new(),
        };
        for feature in [
            ns::DISCO_INFO,
            ns::CAPS,
            ns::PING,
            ns::CARBONS,
            ns::FORWARD,
            ns::XHTML_IM,
            ns::MUC,
        ] {
            caps.add_feature(feature);
        }
        caps
    }

    /// Features are kept sorted and unique.
    pub fn add_feature(&mut self, feature: &str) {
        if let Err(position) = self.features.binary_search_by(|f| f.as_str().cmp(feature)) {
            self.features.insert(position, feature.to_string());
        }
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Verification string: base64 of the sha-256 over `category/type//name<feature<...`.
    pub fn ver(&self) -> String {
        let mut input = format!("{}/{}//{}<", self.category, self.kind, self.name);
        for feature in &self.features {
            input.push_str(feature);
            input.push('<');
        }
        BASE64.encode(Sha256::digest(input.as_bytes()))
    }

    /// `<c/>` element attached to outgoing presence.
    pub fn caps_element(&self) -> Element {
        Element::with_ns("c", ns::CAPS)
            .attr("hash", "sha-256")
            .attr("node", self.node.clone())
            .attr("ver", self.ver())
    }

    /// Disco#info query, echoing `node` when the request names one.
    pub fn disco_info(&self, node: Option<&str>) -> Element {
        let mut query = Element::with_ns("query", ns::DISCO_INFO).attr_opt("node", node);
        query.append(
            Element::new("identity")
                .attr("category", self.category.clone())
                .attr("type", self.kind.clone())
                .attr("name", self.name.clone()),
        );
        for feature in &self.features {
            query.append(Element::new("feature").attr("var", feature.clone()));
        }
        query
    }
}

pub(crate) fn handle(account: &Account, stanza: &Element) -> anyhow::Result<HandlerOutcome> {
    let node = stanza
        .find("query", Some(ns::DISCO_INFO))
        .and_then(|q| q.get_attr("node"));
    debug!(from = ?stanza.get_attr("from"), node = ?node, "Disco info request");
    let reply = iq_result_for(stanza).child(account.capabilities().disco_info(node));
    account.connection().send(reply)?;
    Ok(HandlerOutcome::Preserve)
}
