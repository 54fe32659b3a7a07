//! Property-based tests using proptest
//!
//! These tests verify invariants across randomized inputs: endpoint parsing
//! never accepts malformed urls, tensor payloads survive the wire codecs
//! bit-for-bit, and configs survive TOML round-trips.

use infer_client::transport::http::codec;
use infer_client::transport::{InferOptions, InferRequest, InferResponse};
use infer_client::{ClientConfig, ClientError, Endpoint, ModelIdentity, Scheme, Tensor, TensorSet};
use proptest::prelude::*;

// =============================================================================
// Strategies
// =============================================================================

/// Hostnames made of valid label characters
fn arb_host() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,20}(\\.[a-z][a-z0-9-]{0,10}){0,2}"
}

fn arb_scheme() -> impl Strategy<Value = Scheme> {
    prop_oneof![Just(Scheme::Http), Just(Scheme::Grpc)]
}

/// Row-major shape with up to 3 axes and at most 64 elements
fn arb_shape() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..5, 1..=3)
}

fn arb_i64_tensor() -> impl Strategy<Value = Tensor> {
    arb_shape().prop_flat_map(|shape| {
        let count = shape.iter().product::<usize>();
        prop::collection::vec(any::<i64>(), count)
            .prop_map(move |values| Tensor::from_slice(&shape, &values).unwrap())
    })
}

fn arb_f32_tensor() -> impl Strategy<Value = Tensor> {
    arb_shape().prop_flat_map(|shape| {
        let count = shape.iter().product::<usize>();
        // Arbitrary bit patterns, NaN payloads included
        prop::collection::vec(any::<u32>().prop_map(f32::from_bits), count)
            .prop_map(move |values| Tensor::from_slice(&shape, &values).unwrap())
    })
}

fn request(inputs: TensorSet) -> InferRequest {
    let outputs = inputs.names().map(|name| format!("{}_out", name)).collect();
    InferRequest {
        model: ModelIdentity::new("identity", None).unwrap(),
        id: "7".to_string(),
        inputs,
        outputs,
        options: InferOptions::default(),
        timeout: None,
    }
}

// =============================================================================
// Endpoint parsing
// =============================================================================

proptest! {
    /// Every well-formed scheme://host:port parses back to its parts
    #[test]
    fn prop_valid_endpoints_parse(scheme in arb_scheme(), host in arb_host(), port in 1u16..) {
        let url = format!("{}://{}:{}", scheme, host, port);
        let endpoint = Endpoint::parse(&url).unwrap();
        prop_assert_eq!(endpoint.scheme, scheme);
        prop_assert_eq!(&endpoint.host, &host);
        prop_assert_eq!(endpoint.port, port);
        prop_assert_eq!(endpoint.to_string(), url);
    }

    /// Unsupported schemes are rejected as invalid urls
    #[test]
    fn prop_unknown_scheme_rejected(scheme in "[a-z]{2,8}", host in arb_host()) {
        prop_assume!(scheme != "http" && scheme != "grpc");
        let err = Endpoint::parse(&format!("{}://{}:8000", scheme, host)).unwrap_err();
        let is_invalid_url = matches!(err, ClientError::InvalidUrl { .. });
        prop_assert!(is_invalid_url);
    }

    /// Ports outside 1..=65535 or not numeric are rejected
    #[test]
    fn prop_bad_port_rejected(host in arb_host(), port in "(0|[7-9][0-9]{4,6}|[a-z]{1,5})") {
        let url = format!("http://{}:{}", host, port);
        prop_assert!(Endpoint::parse(&url).is_err(), "accepted {}", url);
    }

    /// Urls carrying a path, query or credentials are rejected
    #[test]
    fn prop_extra_url_parts_rejected(host in arb_host(), suffix in "(/[a-z]{1,5}|\\?[a-z]=1|#x)") {
        let url = format!("grpc://{}:8001{}", host, suffix);
        prop_assert!(Endpoint::parse(&url).is_err(), "accepted {}", url);
        let url = format!("http://user@{}:8000", host);
        prop_assert!(Endpoint::parse(&url).is_err(), "accepted {}", url);
    }

    /// Parsing never panics on arbitrary input
    #[test]
    fn prop_parse_never_panics(url in "\\PC{0,40}") {
        let _ = Endpoint::parse(&url);
    }
}

// =============================================================================
// Wire codec bit-exactness
// =============================================================================

proptest! {
    /// Server view of an encoded request holds the exact input bytes
    #[test]
    fn prop_http_request_preserves_bytes(ints in arb_i64_tensor(), floats in arb_f32_tensor()) {
        let inputs = TensorSet::new().with("INT", ints.clone()).with("FLOAT", floats.clone());
        let (body, header_length) = codec::encode_request(&request(inputs)).unwrap();

        let (id, decoded, outputs) = codec::decode_request(&body, Some(header_length)).unwrap();
        prop_assert_eq!(id, "7");
        prop_assert_eq!(outputs, vec!["INT_out".to_string(), "FLOAT_out".to_string()]);
        prop_assert_eq!(decoded.get("INT").unwrap().as_bytes(), ints.as_bytes());
        prop_assert_eq!(decoded.get("FLOAT").unwrap().as_bytes(), floats.as_bytes());
        prop_assert_eq!(decoded.get("FLOAT").unwrap().shape(), floats.shape());
    }

    /// Echoed responses decode to the original bytes and shapes
    #[test]
    fn prop_http_response_preserves_bytes(ints in arb_i64_tensor(), floats in arb_f32_tensor()) {
        let response = InferResponse {
            model_name: "identity".to_string(),
            model_version: "1".to_string(),
            id: "7".to_string(),
            outputs: TensorSet::new().with("INT_out", ints.clone()).with("FLOAT_out", floats.clone()),
        };
        let (body, header_length) = codec::encode_response(&response).unwrap();
        let decoded = codec::decode_response(&body, Some(header_length)).unwrap();

        prop_assert_eq!(decoded.outputs.get("INT_out").unwrap(), &ints);
        prop_assert_eq!(
            decoded.outputs.get("FLOAT_out").unwrap().as_bytes(),
            floats.as_bytes()
        );
    }

    /// gRPC raw contents carry the exact tensor bytes
    #[test]
    fn prop_grpc_request_preserves_bytes(ints in arb_i64_tensor()) {
        let inputs = TensorSet::new().with("INT", ints.clone());
        let grpc_request = infer_client::transport::grpc::encode_request(&request(inputs)).unwrap();
        let message = grpc_request.into_inner();

        prop_assert_eq!(&message.raw_input_contents[0], ints.as_bytes());
        let shape: Vec<i64> = ints.shape().iter().map(|&dim| dim as i64).collect();
        prop_assert_eq!(&message.inputs[0].shape, &shape);
    }

    /// Adding then removing the batch axis is the identity
    #[test]
    fn prop_batch_axis_round_trip(tensor in arb_i64_tensor()) {
        let batched = tensor.clone().with_batch_axis();
        prop_assert_eq!(batched.shape()[0], 1);
        prop_assert_eq!(batched.without_batch_axis().unwrap(), tensor);
    }
}

// =============================================================================
// Config
// =============================================================================

proptest! {
    /// ClientConfig serializes to TOML and deserializes back to equal value
    #[test]
    fn prop_client_config_toml_round_trip(
        host in arb_host(),
        model in "[a-z][a-z0-9_]{0,20}",
        version in prop::option::of("[1-9][0-9]{0,3}"),
        lazy_init in any::<bool>(),
        init_timeout_s in 1u32..600,
        max_workers in 1usize..512,
    ) {
        let config = ClientConfig {
            url: format!("grpc://{}:8001", host),
            model_name: model,
            model_version: version,
            lazy_init,
            init_timeout_s: init_timeout_s as f64,
            max_workers,
            ..Default::default()
        };
        let toml_str = toml::to_string(&config).expect("Failed to serialize to TOML");
        let parsed: ClientConfig = toml::from_str(&toml_str).expect("Failed to parse TOML");
        prop_assert_eq!(&parsed, &config);
        prop_assert!(parsed.validate().is_ok());
    }
}
