//! Header-extension and invocation-argument decoding.
//!
//! Each structured step returns `Result<RawNode, DecodeError>`; the public
//! fallback functions turn failures into text or raw bytes and log at debug.

use fabriclog_core::{DecodeError, HeaderType, RawNode};

use crate::convert::{is_likely_text, to_text};
use crate::protos::{
    decode_message, principal_to_node, ChaincodeAction, ChaincodeDeploymentSpec, MspPrincipal,
    PrincipalClassification, SignaturePolicy, SignaturePolicyEnvelope, ToNode,
};

/// Keys leading from a transaction action to the chaincode invocation input.
const INVOCATION_INPUT_PATH: [&str; 5] = [
    "payload",
    "chaincode_proposal_payload",
    "input",
    "chaincode_spec",
    "input",
];

// ─── Header extension ────────────────────────────────────────────────────────

/// Result of classifying a channel-header extension.
#[derive(Debug, Clone, PartialEq)]
pub enum Extension {
    /// Endorser transaction extension decoded as a `ChaincodeAction`.
    ChaincodeAction(RawNode),
    Text(String),
    /// Left untouched; the tree converter renders it as hex or text later.
    Raw(Vec<u8>),
}

impl Extension {
    pub fn into_node(self) -> RawNode {
        match self {
            Self::ChaincodeAction(node) => node,
            Self::Text(text) => RawNode::Text(text),
            Self::Raw(bytes) => RawNode::Bytes(bytes),
        }
    }
}

pub fn classify_header_extension(extension: &[u8], header_type: HeaderType) -> Extension {
    if header_type == HeaderType::EndorserTransaction {
        return match decode_chaincode_action(extension) {
            Ok(node) => Extension::ChaincodeAction(node),
            Err(e) => {
                tracing::debug!(error = %e, "endorser transaction header extension kept as raw bytes");
                Extension::Raw(extension.to_vec())
            }
        };
    }
    if is_likely_text(extension) {
        Extension::Text(to_text(extension))
    } else {
        Extension::Raw(extension.to_vec())
    }
}

pub fn decode_chaincode_action(bytes: &[u8]) -> Result<RawNode, DecodeError> {
    let action: ChaincodeAction = decode_message("ChaincodeAction", bytes)?;
    Ok(action.to_node())
}

// ─── Lifecycle payloads ──────────────────────────────────────────────────────

/// Decode a chaincode package descriptor. A message without a chaincode spec
/// is rejected, since arbitrary bytes often parse as an all-default message.
pub fn decode_deployment_spec(bytes: &[u8]) -> Result<RawNode, DecodeError> {
    let spec: ChaincodeDeploymentSpec = decode_message("ChaincodeDeploymentSpec", bytes)?;
    if spec.chaincode_spec.is_none() {
        return Err(DecodeError::Shape {
            message: "ChaincodeDeploymentSpec",
            reason: "missing chaincode_spec".into(),
        });
    }
    Ok(spec.to_node())
}

pub fn decode_signature_policy(bytes: &[u8]) -> Result<RawNode, DecodeError> {
    let envelope: SignaturePolicyEnvelope = decode_message("SignaturePolicyEnvelope", bytes)?;
    let identities = envelope
        .identities
        .iter()
        .map(principal_to_node)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RawNode::map()
        .with("version", envelope.version)
        .with("rule", envelope.rule.to_node())
        .with("identities", identities))
}

/// Returns `true` if `bytes` decode as a signature policy envelope with a
/// rule and only known principal classifications.
pub fn is_signature_policy_envelope(bytes: &[u8]) -> bool {
    let Ok(envelope) = decode_message::<SignaturePolicyEnvelope>("SignaturePolicyEnvelope", bytes)
    else {
        return false;
    };
    envelope.rule.as_ref().is_some_and(rule_is_set)
        && envelope.identities.iter().all(known_classification)
}

fn rule_is_set(rule: &SignaturePolicy) -> bool {
    use crate::protos::signature_policy::Type;
    match &rule.r#type {
        Some(Type::SignedBy(_)) => true,
        Some(Type::NOutOf(n)) => n.rules.iter().all(rule_is_set),
        None => false,
    }
}

fn known_classification(p: &MspPrincipal) -> bool {
    PrincipalClassification::try_from(p.principal_classification).is_ok()
}

// ─── Invocation arguments ────────────────────────────────────────────────────

/// Text if the bytes look like text, otherwise the untouched bytes.
pub fn text_or_raw(bytes: &[u8]) -> RawNode {
    if is_likely_text(bytes) {
        RawNode::Text(to_text(bytes))
    } else {
        RawNode::Bytes(bytes.to_vec())
    }
}

fn package_or_fallback(bytes: &[u8]) -> RawNode {
    match decode_deployment_spec(bytes) {
        Ok(node) => node,
        Err(e) => {
            tracing::debug!(error = %e, "deploy argument is not a deployment spec");
            if is_signature_policy_envelope(bytes) {
                if let Ok(node) = decode_signature_policy(bytes) {
                    return node;
                }
            }
            text_or_raw(bytes)
        }
    }
}

fn policy_or_fallback(bytes: &[u8]) -> RawNode {
    decode_signature_policy(bytes).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "deploy argument is not a signature policy");
        text_or_raw(bytes)
    })
}

/// Decode chaincode invocation arguments.
///
/// For a lifecycle `deploy` call (`["deploy", channel, package, policy, ..]`)
/// the package and policy are decoded structurally; every other argument is
/// text if it looks like text, else raw bytes.
pub fn decode_invocation_arguments(args: &[Vec<u8>]) -> Vec<RawNode> {
    let Some(first) = args.first() else {
        return Vec::new();
    };
    if to_text(first) != "deploy" {
        return args.iter().map(|a| text_or_raw(a)).collect();
    }

    args.iter()
        .enumerate()
        .map(|(i, arg)| match i {
            0 | 1 => RawNode::Text(to_text(arg)),
            2 => package_or_fallback(arg),
            3 => policy_or_fallback(arg),
            _ => text_or_raw(arg),
        })
        .collect()
}

/// Decode the invocation arguments of every action in an endorser
/// transaction's `payload.data` tree, in place.
pub fn rewrite_invocation_inputs(data: &mut RawNode) {
    let Some(actions) = data.get_mut("actions").and_then(RawNode::as_list_mut) else {
        return;
    };
    for action in actions {
        let Some(input) = action.pointer_mut(&INVOCATION_INPUT_PATH) else {
            continue;
        };
        let Some(args) = input.get_mut("args") else {
            continue;
        };
        let raw: Option<Vec<Vec<u8>>> = args
            .as_list()
            .and_then(|items| items.iter().map(|a| a.as_bytes().map(<[u8]>::to_vec)).collect());
        match raw {
            Some(raw) => *args = RawNode::List(decode_invocation_arguments(&raw)),
            None => tracing::debug!("invocation args are not a list of byte strings, left as-is"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(h: &str) -> Vec<u8> {
        hex::decode(h).unwrap()
    }

    const HIGH_THROUGHPUT_CDS: &str =
        "0a1e08011216120f686967682d7468726f7567687075741a03312e301a020a00";
    const SMALLBANK_CDS: &str = "0a1b0801120f1209736d616c6c62616e6b1a0276301a060a04696e6974";
    const THREE_ORG_POLICY: &str = "1210120e08031202080012020801120208021a0f120d0a0b41746c616e7469734d53501a0c120a0a084b617267614d53501a11120f0a0d4e65766572677265656e4d5350";

    #[test]
    fn chaincode_action_extension() {
        let node = decode_chaincode_action(&buf("120612046c736363")).unwrap();
        assert_eq!(node.get("events"), Some(&RawNode::Bytes(buf("12046c736363"))));
        assert_eq!(node.get("results"), Some(&RawNode::Bytes(vec![])));
        assert_eq!(node.get("response"), Some(&RawNode::Null));
        assert_eq!(node.get("chaincodeId"), Some(&RawNode::Null));
    }

    #[test]
    fn endorser_extension_falls_back_to_raw() {
        let garbage = vec![0xff, 0xff, 0xff];
        assert_eq!(
            classify_header_extension(&garbage, HeaderType::EndorserTransaction),
            Extension::Raw(garbage.clone())
        );
        assert_eq!(
            classify_header_extension(b"plain", HeaderType::Config),
            Extension::Text("plain".into())
        );
        assert_eq!(
            classify_header_extension(&[0x0a, 0x01], HeaderType::Config),
            Extension::Raw(vec![0x0a, 0x01])
        );
    }

    #[test]
    fn deployment_specs() {
        let node = decode_deployment_spec(&buf(HIGH_THROUGHPUT_CDS)).unwrap();
        let spec = node.get("chaincodeSpec").unwrap();
        assert_eq!(spec.get("type"), Some(&RawNode::from("GOLANG")));
        let id = spec.get("chaincodeId").unwrap();
        assert_eq!(id.get("name"), Some(&RawNode::from("high-throughput")));
        assert_eq!(id.get("version"), Some(&RawNode::from("1.0")));
        assert_eq!(id.get("path"), Some(&RawNode::from("")));
        assert_eq!(node.get("execEnv"), Some(&RawNode::from("DOCKER")));

        let node = decode_deployment_spec(&buf(SMALLBANK_CDS)).unwrap();
        let spec = node.get("chaincodeSpec").unwrap();
        assert_eq!(
            spec.get("chaincodeId").and_then(|id| id.get("name")),
            Some(&RawNode::from("smallbank"))
        );
        let args = spec.get("input").and_then(|i| i.get("args")).and_then(RawNode::as_list).unwrap();
        assert_eq!(args, &[RawNode::Bytes(b"init".to_vec())]);
    }

    #[test]
    fn signature_policy_envelope() {
        let bytes = buf(THREE_ORG_POLICY);
        assert!(is_signature_policy_envelope(&bytes));
        assert!(decode_deployment_spec(&bytes).is_err());

        let node = decode_signature_policy(&bytes).unwrap();
        assert_eq!(node.get("version"), Some(&RawNode::from(0i32)));
        let rule = node.get("rule").unwrap();
        assert_eq!(rule.get("Type"), Some(&RawNode::from("nOutOf")));
        let n_out_of = rule.get("nOutOf").unwrap();
        assert_eq!(n_out_of.get("n"), Some(&RawNode::from(3i32)));
        let rules = n_out_of.get("rules").and_then(RawNode::as_list).unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[2].get("signedBy"), Some(&RawNode::from(2i32)));

        let identities = node.get("identities").and_then(RawNode::as_list).unwrap();
        let msps: Vec<_> = identities
            .iter()
            .filter_map(|i| i.get("principal").and_then(|p| p.get("mspIdentifier")))
            .cloned()
            .collect();
        assert_eq!(
            msps,
            vec![
                RawNode::from("AtlantisMSP"),
                RawNode::from("KargaMSP"),
                RawNode::from("NevergreenMSP")
            ]
        );
        assert_eq!(
            identities[0].get("principal").and_then(|p| p.get("role")),
            Some(&RawNode::from("MEMBER"))
        );
    }

    #[test]
    fn deploy_arguments_are_decoded() {
        let args = vec![
            b"deploy".to_vec(),
            b"mychannel".to_vec(),
            buf(HIGH_THROUGHPUT_CDS),
            buf(THREE_ORG_POLICY),
            b"escc".to_vec(),
            b"vscc".to_vec(),
        ];
        let decoded = decode_invocation_arguments(&args);
        assert_eq!(decoded.len(), 6);
        assert_eq!(decoded[0], RawNode::from("deploy"));
        assert_eq!(decoded[1], RawNode::from("mychannel"));
        assert!(decoded[2].get("chaincodeSpec").is_some());
        assert!(decoded[3].get("rule").is_some());
        assert_eq!(decoded[4], RawNode::from("escc"));
        assert_eq!(decoded[5], RawNode::from("vscc"));
    }

    #[test]
    fn deploy_package_falls_back() {
        // A policy in the package slot decodes as a policy.
        let args = vec![b"deploy".to_vec(), b"ch".to_vec(), buf(THREE_ORG_POLICY)];
        let decoded = decode_invocation_arguments(&args);
        assert!(decoded[2].get("rule").is_some());

        // Neither shape: text or raw.
        let args = vec![b"deploy".to_vec(), b"ch".to_vec(), b"not-a-package".to_vec(), vec![0xff, 0x01]];
        let decoded = decode_invocation_arguments(&args);
        assert_eq!(decoded[2], RawNode::from("not-a-package"));
        assert_eq!(decoded[3], RawNode::Bytes(vec![0xff, 0x01]));
    }

    #[test]
    fn ordinary_invocation_arguments() {
        let args = vec![b"transfer".to_vec(), b"a".to_vec(), vec![0x01, 0x02]];
        assert_eq!(
            decode_invocation_arguments(&args),
            vec![RawNode::from("transfer"), RawNode::from("a"), RawNode::Bytes(vec![0x01, 0x02])]
        );
        assert!(decode_invocation_arguments(&[]).is_empty());
    }

    #[test]
    fn rewrites_actions_in_place() {
        let input = RawNode::map().with(
            "args",
            vec![RawNode::from(b"invoke".to_vec()), RawNode::from(vec![0x00u8])],
        );
        let action = RawNode::map().with(
            "payload",
            RawNode::map().with(
                "chaincode_proposal_payload",
                RawNode::map().with(
                    "input",
                    RawNode::map().with("chaincode_spec", RawNode::map().with("input", input)),
                ),
            ),
        );
        let mut data = RawNode::map().with("actions", vec![action]);
        rewrite_invocation_inputs(&mut data);

        let args = data
            .pointer_mut(&["actions"])
            .and_then(|a| a.as_list_mut())
            .and_then(|a| a[0].pointer_mut(&INVOCATION_INPUT_PATH))
            .and_then(|i| i.get("args"))
            .and_then(RawNode::as_list)
            .unwrap()
            .to_vec();
        assert_eq!(args, vec![RawNode::from("invoke"), RawNode::Bytes(vec![0x00])]);
    }
}
