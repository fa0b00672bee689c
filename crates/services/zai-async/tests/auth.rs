use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use proptest::prelude::*;
use secrecy::SecretString;
use sha2::Sha256;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};
use zai_async::auth::Claims;
use zai_async::{Client, ClientOptions, CredentialError, RequestOptions, TokenGenerator, ZaiError};

fn well_formed(s: &str) -> bool {
    let mut parts = s.split('.');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(a), Some(b), None) if !a.is_empty() && !b.is_empty()
    )
}

/// Verifies the HS256 signature with `secret` and returns the decoded claims
fn verify(token: &str, secret: &str) -> Claims {
    let segments: Vec<&str> = token.split('.').collect();
    assert_eq!(segments.len(), 3, "not a compact JWS: {token}");

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.{}", segments[0], segments[1]).as_bytes());
    mac.verify_slice(&URL_SAFE_NO_PAD.decode(segments[2]).unwrap())
        .expect("signature mismatch");

    let header: serde_json::Value =
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segments[0]).unwrap()).unwrap();
    assert_eq!(header["alg"], "HS256");
    assert_eq!(header["sign_type"], "SIGN");

    serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segments[1]).unwrap()).unwrap()
}

proptest! {
    #[test]
    fn malformed_credentials_are_rejected(s in ".{0,24}") {
        prop_assume!(!well_formed(&s));
        let err = TokenGenerator::default().generate(&s).unwrap_err();
        prop_assert!(matches!(
            err,
            ZaiError::Credential(CredentialError::Empty | CredentialError::Invalid)
        ));
    }

    #[test]
    fn dotted_garbage_is_rejected(a in "[a-z]{0,4}", b in "[a-z]{0,4}", c in "[a-z]{0,4}") {
        let s = format!("{a}.{b}.{c}");
        prop_assert!(TokenGenerator::default().generate(&s).is_err());
    }

    #[test]
    fn tokens_verify_with_the_secret(id in "[A-Za-z0-9]{1,16}", secret in "[A-Za-z0-9_-]{1,32}") {
        let token = TokenGenerator::default().generate(&format!("{id}.{secret}")).unwrap();
        let claims = verify(&token, &secret);
        prop_assert_eq!(claims.api_key, id);
        let ttl = claims.exp - claims.timestamp;
        prop_assert!((209_999..=210_001).contains(&ttl), "ttl {}", ttl);
    }
}

#[tokio::test]
async fn bearer_on_the_wire_is_signed_with_the_secret() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let client = Client::new(ClientOptions {
        api_key: Some(SecretString::from("key-id.key-secret")),
        base_url: Some(server.uri()),
        ..ClientOptions::default()
    })
    .unwrap();

    for _ in 0..2 {
        let _: serde_json::Value = client.get("/v1/me", RequestOptions::default()).await.unwrap();
    }

    let requests = server.received_requests().await.unwrap();
    let bearer = |i: usize| {
        requests[i]
            .headers
            .get("authorization")
            .unwrap()
            .to_str()
            .unwrap()
            .strip_prefix("Bearer ")
            .unwrap()
            .to_owned()
    };

    let claims = verify(&bearer(0), "key-secret");
    assert_eq!(claims.api_key, "key-id");
    // second call inside the cache window reuses the token
    assert_eq!(bearer(0), bearer(1));
    assert_eq!(client.tokens().size(), 1);
}
