//! Dockerfile parse/plan behavior across module boundaries.

use proptest::prelude::*;
use simple_test_case::test_case;
use skiff_lib::dockerfile::{Dockerfile, LayerOp, Planner, Vars};

const SAMPLES: &[&str] = &[
    "FROM alpine:3.19\nRUN apk add --no-cache curl\nCMD [\"/bin/sh\"]\n",
    "ARG BASE=debian\nFROM $BASE:stable AS runtime\nENV LANG=C.UTF-8 TERM=xterm\nWORKDIR /srv\nUSER 1000:1000\nEXPOSE 8080 8443\n",
    "FROM golang:1.22 AS build\nRUN go build ./...\nFROM scratch\nLABEL team=infra release=\"2024 spring\"\nENTRYPOINT [\"/app\"]\n",
    "FROM alpine\nRUN <<EOF\necho one\necho two\nEOF\nSTOPSIGNAL SIGTERM\n",
    "FROM alpine\nRUN apk add \\\n    curl \\\n    jq\nSHELL [\"/bin/ash\", \"-c\"]\nRUN echo done\n",
];

#[test]
fn reparsing_canonical_form_is_stable() {
    for source in SAMPLES {
        let first = Dockerfile::parse(source).expect("parse sample");
        let canonical = first.canonicalize();
        let second = Dockerfile::parse(&canonical).expect("reparse canonical form");

        let strip = |d: &Dockerfile| {
            d.instructions
                .iter()
                .map(|p| p.instruction.clone())
                .collect::<Vec<_>>()
        };
        pretty_assertions::assert_eq!(strip(&first), strip(&second), "sample: {source}");

        // Canonicalizing again is a fixed point.
        pretty_assertions::assert_eq!(canonical, second.canonicalize());
    }
}

#[test]
fn from_expansion_matches_recorded_reference() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dockerfile =
        Dockerfile::parse("ARG VERSION=3.19\nFROM alpine:$VERSION\nRUN true\n").expect("parse");
    let plan = Planner::new(dir.path()).plan(&dockerfile).expect("plan");

    pretty_assertions::assert_eq!(plan.from_image, "alpine:3.19");
    pretty_assertions::assert_eq!(plan.base.to_string(), "docker.io/library/alpine:3.19");
}

#[test_case("config.json", true; "plain_file")]
#[test_case("dir/sub/file", true; "nested")]
#[test_case("./dir/../file", true; "dotdot_within_root")]
#[test_case("/abs/path", true; "absolute_reanchored")]
#[test_case("..", false; "parent")]
#[test_case("../sibling", false; "escape_simple")]
#[test_case("a/../../b", false; "escape_through_subdir")]
#[test_case("/..", false; "absolute_escape")]
#[test]
fn copy_path_validation(path: &str, accepted: bool) {
    let dir = tempfile::tempdir().expect("tempdir");
    if accepted {
        // Create the source where the planner will resolve it.
        let mut normalized: Vec<&str> = Vec::new();
        for component in path.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    normalized.pop();
                }
                other => normalized.push(other),
            }
        }
        let mut full = dir.path().to_path_buf();
        for (i, component) in normalized.iter().enumerate() {
            full.push(component);
            if i + 1 < normalized.len() {
                std::fs::create_dir_all(&full).expect("mkdir");
            } else {
                std::fs::write(&full, b"payload").expect("write");
            }
        }
    }

    let source = format!("FROM a\nCOPY {path} /dst\n");
    let dockerfile = Dockerfile::parse(&source).expect("parse");
    let result = Planner::new(dir.path()).plan(&dockerfile);
    pretty_assertions::assert_eq!(result.is_ok(), accepted, "path: {path}");
}

#[test]
fn nul_in_copy_path_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dockerfile = Dockerfile::parse("FROM a\nCOPY \"bad\0name\" /dst\n").expect("parse");
    assert!(Planner::new(dir.path()).plan(&dockerfile).is_err());
}

#[test]
fn shell_override_applies_to_later_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dockerfile = Dockerfile::parse(
        "FROM a\nRUN echo before\nSHELL [\"/bin/ash\", \"-eu\", \"-c\"]\nRUN echo after\n",
    )
    .expect("parse");
    let plan = Planner::new(dir.path()).plan(&dockerfile).expect("plan");

    let argv = |index: usize| match &plan.ops[index].op {
        LayerOp::Run { argv, .. } => argv.clone(),
        other => panic!("expected run, got {other:?}"),
    };
    pretty_assertions::assert_eq!(argv(0), vec!["/bin/sh", "-c", "echo before"]);
    pretty_assertions::assert_eq!(argv(1), vec!["/bin/ash", "-eu", "-c", "echo after"]);
}

fn var_name() -> impl Strategy<Value = String> {
    "[A-Z][A-Z0-9_]{0,8}"
}

fn template() -> impl Strategy<Value = String> {
    // Fragments that exercise every expansion form, stitched together.
    proptest::collection::vec(
        prop_oneof![
            Just(" plain text ".to_string()),
            "[a-z ./:-]{0,8}",
            var_name().prop_map(|n| format!("${n}")),
            var_name().prop_map(|n| format!("${{{n}}}")),
            (var_name(), "[a-z]{0,5}").prop_map(|(n, d)| format!("${{{n}:-{d}}}")),
            (var_name(), "[a-z]{0,5}").prop_map(|(n, a)| format!("${{{n}:+{a}}}")),
        ],
        0..6,
    )
    .prop_map(|parts| parts.concat())
}

proptest! {
    // Expanding an already-expanded string changes nothing when values hold
    // no variable references of their own.
    #[test]
    fn expansion_is_idempotent(
        input in template(),
        names in proptest::collection::vec(var_name(), 0..4),
        values in proptest::collection::vec("[a-z0-9.]{0,6}", 0..4),
    ) {
        let mut vars = Vars::new();
        for (name, value) in names.iter().zip(values.iter()) {
            vars.set(name, value).expect("set");
        }

        let once = vars.expand(&input).expect("expand");
        let twice = vars.expand(&once).expect("expand expanded");
        prop_assert_eq!(once, twice);
    }
}
