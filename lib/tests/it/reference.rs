use std::str::FromStr;

use proptest::prelude::*;
use simple_test_case::test_case;
use skiff_lib::{Digest, Reference, Version};

#[test_case("docker.io/library/ubuntu:latest", "docker.io", "library/ubuntu", "latest"; "fully_qualified")]
#[test_case("ubuntu", "docker.io", "library/ubuntu", "latest"; "bare_name")]
#[test_case("ubuntu:24.04", "docker.io", "library/ubuntu", "24.04"; "bare_name_with_tag")]
#[test_case("library/ubuntu", "docker.io", "library/ubuntu", "latest"; "namespaced")]
#[test_case("ghcr.io/org/app:v1", "ghcr.io", "org/app", "v1"; "other_registry")]
#[test_case("localhost:5000/app", "localhost:5000", "app", "latest"; "localhost_with_port")]
#[test]
fn parse(input: &str, host: &str, repository: &str, tag: &str) {
    let reference = input.parse::<Reference>().expect("parse");
    pretty_assertions::assert_eq!(reference.host, host);
    pretty_assertions::assert_eq!(reference.repository, repository);
    pretty_assertions::assert_eq!(reference.version, Version::tag(tag));
}

#[test]
fn parse_digest_reference() {
    let digest = "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";
    let reference = format!("ghcr.io/org/app@{digest}")
        .parse::<Reference>()
        .expect("parse");
    let Version::Digest(parsed) = &reference.version else {
        panic!("expected digest version");
    };
    pretty_assertions::assert_eq!(parsed.to_string(), digest);
}

#[test_case("/repo:tag"; "leading_slash")]
#[test_case("host//name"; "empty_segment")]
#[test_case(""; "empty")]
#[test]
fn invalid_references(input: &str) {
    let _ = input.parse::<Reference>().expect_err("must error");
}

fn host_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]*(\\.[a-z0-9-]+)*\\.[a-z]{2,5}".prop_filter("no dotdot", |s| !s.contains(".."))
}

fn repository_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]*/[a-z][a-z0-9-]*"
}

fn tag_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9][a-zA-Z0-9._-]{0,30}"
}

fn digest_strategy() -> impl Strategy<Value = String> {
    "sha256:[a-f0-9]{64}"
}

fn reference_strategy() -> impl Strategy<Value = Reference> {
    (
        host_strategy(),
        repository_strategy(),
        prop_oneof![
            tag_strategy().prop_map(Version::Tag),
            digest_strategy().prop_map(|digest| {
                Version::Digest(Digest::from_str(&digest).expect("parse digest"))
            })
        ],
    )
        .prop_map(|(host, repository, version)| Reference {
            host,
            repository,
            version,
        })
}

proptest! {
    // Formatting a reference and parsing the result yields the original.
    #[test]
    fn roundtrip_parse_format(reference in reference_strategy()) {
        let formatted = reference.to_string();
        let parsed = formatted.parse::<Reference>().expect("reparse");
        prop_assert_eq!(reference, parsed);
    }

    #[test]
    fn default_version_is_latest(host in host_strategy(), repository in repository_strategy()) {
        let input = format!("{host}/{repository}");
        let reference = input.parse::<Reference>().expect("parse");
        prop_assert!(matches!(reference.version, Version::Tag(tag) if tag == "latest"));
    }

    #[test]
    fn digest_roundtrip(hex in "[a-f0-9]{64}") {
        let digest = Digest::from_sha256(&hex).expect("parse");
        let formatted = digest.to_string();
        prop_assert_eq!(Digest::from_str(&formatted).expect("reparse"), digest);
    }
}
