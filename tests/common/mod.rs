use std::sync::Arc;

use serde_json::{json, Value};
use url::Url;
use wiremock::MockServer;

use smartfhir::capability::CapabilityStore;
use smartfhir::gateway::{RequestGateway, Unsigned};

#[allow(dead_code)]
pub fn unsigned_gateway(server: &MockServer) -> RequestGateway {
    let base = Url::parse(&format!("{}/fhir/", server.uri())).expect("valid base URL");
    RequestGateway::new(reqwest::Client::new(), base, Arc::new(Unsigned))
}

#[allow(dead_code)]
pub fn capability_store(server: &MockServer) -> Arc<CapabilityStore> {
    Arc::new(CapabilityStore::new(unsigned_gateway(server)))
}

/// Capability statement advertising SMART endpoints nested in the
/// `oauth-uris` extension.
#[allow(dead_code)]
pub fn smart_capability(authorize: &str, token: Option<&str>) -> Value {
    let mut uris = vec![json!({"url": "authorize", "valueUri": authorize})];
    if let Some(token) = token {
        uris.push(json!({"url": "token", "valueUri": token}));
    }
    json!({
        "resourceType": "CapabilityStatement",
        "fhirVersion": "4.0.1",
        "format": ["json"],
        "rest": [{
            "mode": "server",
            "security": {
                "service": [{"coding": [{"code": "SMART-on-FHIR"}]}],
                "extension": [{
                    "url": "http://fhir-registry.smarthealthit.org/StructureDefinition/oauth-uris",
                    "extension": uris
                }]
            },
            "resource": [
                {"type": "Patient", "interaction": [{"code": "read"}, {"code": "search-type"}]}
            ]
        }]
    })
}

/// Capability statement without a security block.
#[allow(dead_code)]
pub fn open_capability() -> Value {
    json!({
        "resourceType": "CapabilityStatement",
        "fhirVersion": "4.0.1",
        "rest": [{"mode": "server"}]
    })
}

#[allow(dead_code)]
pub fn patient(id: &str, given: &str, family: &str, birth_date: &str) -> Value {
    json!({
        "resourceType": "Patient",
        "id": id,
        "name": [{"use": "official", "given": [given], "family": family}],
        "birthDate": birth_date
    })
}

/// Search-set bundle with optional `total` and `next` link.
#[allow(dead_code)]
pub fn bundle(patients: Vec<Value>, total: Option<u64>, next: Option<&str>) -> Value {
    let mut bundle = json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "entry": patients.into_iter().map(|p| json!({"resource": p})).collect::<Vec<_>>()
    });
    if let Some(total) = total {
        bundle["total"] = json!(total);
    }
    if let Some(next) = next {
        bundle["link"] = json!([{"relation": "next", "url": next}]);
    }
    bundle
}

/// Token endpoint success body.
#[allow(dead_code)]
pub fn token_body(access_token: &str) -> Value {
    json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": 3600,
        "refresh_token": "refresh-1",
        "scope": "user/*.* openid profile"
    })
}

/// Query parameter `name` of `url`.
#[allow(dead_code)]
pub fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}
