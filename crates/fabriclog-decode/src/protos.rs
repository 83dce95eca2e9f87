//! Fabric protobuf messages needed to decode header extensions and lifecycle
//! invocation arguments, plus their conversion into payload trees.
//!
//! Only the subset of `peer` and `common` messages the decoder touches is
//! declared. Conversions include default values, render enums by name and
//! oneofs with a `Type` discriminator key, matching how the records have
//! always been shaped downstream.

use std::collections::HashMap;

use fabriclog_core::{DecodeError, RawNode};
use prost::Message;

// ─── peer ────────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct ChaincodeId {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub version: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Response {
    #[prost(int32, tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChaincodeAction {
    #[prost(bytes = "vec", tag = "1")]
    pub results: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub events: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub response: Option<Response>,
    #[prost(message, optional, tag = "4")]
    pub chaincode_id: Option<ChaincodeId>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChaincodeInput {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub args: Vec<Vec<u8>>,
    #[prost(map = "string, bytes", tag = "2")]
    pub decorations: HashMap<String, Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ChaincodeType {
    Undefined = 0,
    Golang = 1,
    Node = 2,
    Car = 3,
    Java = 4,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChaincodeSpec {
    #[prost(enumeration = "ChaincodeType", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub chaincode_id: Option<ChaincodeId>,
    #[prost(message, optional, tag = "3")]
    pub input: Option<ChaincodeInput>,
    #[prost(int32, tag = "4")]
    pub timeout: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ExecutionEnvironment {
    Docker = 0,
    System = 1,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChaincodeDeploymentSpec {
    #[prost(message, optional, tag = "1")]
    pub chaincode_spec: Option<ChaincodeSpec>,
    #[prost(bytes = "vec", tag = "3")]
    pub code_package: Vec<u8>,
    #[prost(enumeration = "ExecutionEnvironment", tag = "4")]
    pub exec_env: i32,
}

// ─── common (policies, msp principals) ───────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct SignaturePolicyEnvelope {
    #[prost(int32, tag = "1")]
    pub version: i32,
    #[prost(message, optional, tag = "2")]
    pub rule: Option<SignaturePolicy>,
    #[prost(message, repeated, tag = "3")]
    pub identities: Vec<MspPrincipal>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SignaturePolicy {
    #[prost(oneof = "signature_policy::Type", tags = "1, 2")]
    pub r#type: Option<signature_policy::Type>,
}

pub mod signature_policy {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Type {
        #[prost(int32, tag = "1")]
        SignedBy(i32),
        #[prost(message, tag = "2")]
        NOutOf(super::NOutOf),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct NOutOf {
    #[prost(int32, tag = "1")]
    pub n: i32,
    #[prost(message, repeated, tag = "2")]
    pub rules: Vec<SignaturePolicy>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PrincipalClassification {
    Role = 0,
    OrganizationUnit = 1,
    Identity = 2,
    Anonymity = 3,
    Combined = 4,
}

#[derive(Clone, PartialEq, Message)]
pub struct MspPrincipal {
    #[prost(enumeration = "PrincipalClassification", tag = "1")]
    pub principal_classification: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub principal: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MspRoleType {
    Member = 0,
    Admin = 1,
    Client = 2,
    Peer = 3,
    Orderer = 4,
}

#[derive(Clone, PartialEq, Message)]
pub struct MspRole {
    #[prost(string, tag = "1")]
    pub msp_identifier: String,
    #[prost(enumeration = "MspRoleType", tag = "2")]
    pub role: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct OrganizationUnit {
    #[prost(string, tag = "1")]
    pub msp_identifier: String,
    #[prost(string, tag = "2")]
    pub organizational_unit_identifier: String,
    #[prost(bytes = "vec", tag = "3")]
    pub certifiers_identifier: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum AnonymityType {
    Nominal = 0,
    Anonymous = 1,
}

#[derive(Clone, PartialEq, Message)]
pub struct MspIdentityAnonymity {
    #[prost(enumeration = "AnonymityType", tag = "1")]
    pub anonymity_type: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct CombinedPrincipal {
    #[prost(message, repeated, tag = "1")]
    pub principals: Vec<MspPrincipal>,
}

// ─── Enum names ──────────────────────────────────────────────────────────────

/// Render a known enum value by its protobuf name, unknown values as numbers.
fn enum_node<E: TryFrom<i32>>(value: i32, name: impl Fn(E) -> &'static str) -> RawNode {
    match E::try_from(value) {
        Ok(e) => RawNode::from(name(e)),
        Err(_) => RawNode::from(value),
    }
}

fn chaincode_type_name(t: ChaincodeType) -> &'static str {
    match t {
        ChaincodeType::Undefined => "UNDEFINED",
        ChaincodeType::Golang => "GOLANG",
        ChaincodeType::Node => "NODE",
        ChaincodeType::Car => "CAR",
        ChaincodeType::Java => "JAVA",
    }
}

fn exec_env_name(e: ExecutionEnvironment) -> &'static str {
    match e {
        ExecutionEnvironment::Docker => "DOCKER",
        ExecutionEnvironment::System => "SYSTEM",
    }
}

fn role_name(r: MspRoleType) -> &'static str {
    match r {
        MspRoleType::Member => "MEMBER",
        MspRoleType::Admin => "ADMIN",
        MspRoleType::Client => "CLIENT",
        MspRoleType::Peer => "PEER",
        MspRoleType::Orderer => "ORDERER",
    }
}

fn anonymity_name(a: AnonymityType) -> &'static str {
    match a {
        AnonymityType::Nominal => "NOMINAL",
        AnonymityType::Anonymous => "ANONYMOUS",
    }
}

fn classification_name(c: PrincipalClassification) -> &'static str {
    match c {
        PrincipalClassification::Role => "ROLE",
        PrincipalClassification::OrganizationUnit => "ORGANIZATION_UNIT",
        PrincipalClassification::Identity => "IDENTITY",
        PrincipalClassification::Anonymity => "ANONYMITY",
        PrincipalClassification::Combined => "COMBINED",
    }
}

// ─── Tree conversion ─────────────────────────────────────────────────────────

/// Conversion of a decoded message into a payload tree.
pub trait ToNode {
    fn to_node(&self) -> RawNode;
}

impl<T: ToNode> ToNode for Option<T> {
    fn to_node(&self) -> RawNode {
        self.as_ref().map(ToNode::to_node).unwrap_or(RawNode::Null)
    }
}

impl ToNode for ChaincodeId {
    fn to_node(&self) -> RawNode {
        RawNode::map()
            .with("path", self.path.as_str())
            .with("name", self.name.as_str())
            .with("version", self.version.as_str())
    }
}

impl ToNode for Response {
    fn to_node(&self) -> RawNode {
        RawNode::map()
            .with("status", self.status)
            .with("message", self.message.as_str())
            .with("payload", self.payload.clone())
    }
}

impl ToNode for ChaincodeAction {
    fn to_node(&self) -> RawNode {
        RawNode::map()
            .with("results", self.results.clone())
            .with("events", self.events.clone())
            .with("response", self.response.to_node())
            .with("chaincodeId", self.chaincode_id.to_node())
    }
}

impl ToNode for ChaincodeInput {
    fn to_node(&self) -> RawNode {
        let args: Vec<RawNode> = self.args.iter().map(|a| RawNode::from(a.clone())).collect();
        let mut keys: Vec<&String> = self.decorations.keys().collect();
        keys.sort();
        let mut decorations = RawNode::map();
        for key in keys {
            decorations.insert(key.clone(), self.decorations[key].clone());
        }
        RawNode::map().with("args", args).with("decorations", decorations)
    }
}

impl ToNode for ChaincodeSpec {
    fn to_node(&self) -> RawNode {
        RawNode::map()
            .with("type", enum_node(self.r#type, chaincode_type_name))
            .with("chaincodeId", self.chaincode_id.to_node())
            .with("input", self.input.to_node())
            .with("timeout", self.timeout)
    }
}

impl ToNode for ChaincodeDeploymentSpec {
    fn to_node(&self) -> RawNode {
        RawNode::map()
            .with("chaincodeSpec", self.chaincode_spec.to_node())
            .with("codePackage", self.code_package.clone())
            .with("execEnv", enum_node(self.exec_env, exec_env_name))
    }
}

impl ToNode for SignaturePolicy {
    fn to_node(&self) -> RawNode {
        match &self.r#type {
            Some(signature_policy::Type::SignedBy(idx)) => RawNode::map()
                .with("Type", "signedBy")
                .with("signedBy", *idx),
            Some(signature_policy::Type::NOutOf(n_out_of)) => {
                let rules: Vec<RawNode> = n_out_of.rules.iter().map(ToNode::to_node).collect();
                RawNode::map().with("Type", "nOutOf").with(
                    "nOutOf",
                    RawNode::map().with("n", n_out_of.n).with("rules", rules),
                )
            }
            None => RawNode::map(),
        }
    }
}

impl ToNode for MspRole {
    fn to_node(&self) -> RawNode {
        RawNode::map()
            .with("mspIdentifier", self.msp_identifier.as_str())
            .with("role", enum_node(self.role, role_name))
    }
}

impl ToNode for OrganizationUnit {
    fn to_node(&self) -> RawNode {
        RawNode::map()
            .with("mspIdentifier", self.msp_identifier.as_str())
            .with("organizationalUnitIdentifier", self.organizational_unit_identifier.as_str())
            .with("certifiersIdentifier", self.certifiers_identifier.clone())
    }
}

impl ToNode for MspIdentityAnonymity {
    fn to_node(&self) -> RawNode {
        RawNode::map().with("anonymityType", enum_node(self.anonymity_type, anonymity_name))
    }
}

pub(crate) fn decode_message<M: Message + Default>(message: &'static str, bytes: &[u8]) -> Result<M, DecodeError> {
    M::decode(bytes).map_err(|e| DecodeError::Protobuf {
        message,
        reason: e.to_string(),
    })
}

/// Decode a principal's nested message according to its classification.
///
/// Identity principals carry a serialized certificate and stay binary.
pub fn principal_to_node(p: &MspPrincipal) -> Result<RawNode, DecodeError> {
    let classification = PrincipalClassification::try_from(p.principal_classification).ok();
    let node = match classification {
        Some(PrincipalClassification::Role) => RawNode::map()
            .with("principalClassification", "ROLE")
            .with("principal", decode_message::<MspRole>("MSPRole", &p.principal)?.to_node()),
        Some(PrincipalClassification::OrganizationUnit) => RawNode::map()
            .with("principalClassification", "ORGANIZATION_UNIT")
            .with(
                "principal",
                decode_message::<OrganizationUnit>("OrganizationUnit", &p.principal)?.to_node(),
            ),
        Some(PrincipalClassification::Anonymity) => RawNode::map()
            .with("principalClassification", "ANONYMITY")
            .with(
                "principal",
                decode_message::<MspIdentityAnonymity>("MSPIdentityAnonymity", &p.principal)?.to_node(),
            ),
        Some(PrincipalClassification::Combined) => {
            let combined = decode_message::<CombinedPrincipal>("CombinedPrincipal", &p.principal)?;
            let principals = combined
                .principals
                .iter()
                .map(principal_to_node)
                .collect::<Result<Vec<_>, _>>()?;
            RawNode::map()
                .with("principalClassification", "COMBINED")
                .with("principals", principals)
        }
        Some(c @ PrincipalClassification::Identity) => RawNode::map()
            .with("principalClassification", classification_name(c))
            .with("principal", p.principal.clone()),
        None => {
            tracing::warn!(
                classification = p.principal_classification,
                "unable to convert identity principal"
            );
            RawNode::map()
                .with(
                    "principalClassification",
                    format!("<UNKNOWN {}>", p.principal_classification),
                )
                .with("principal", p.principal.clone())
        }
    };
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_principal_decodes() {
        let role = MspRole {
            msp_identifier: "Org1MSP".into(),
            role: MspRoleType::Admin as i32,
        };
        let p = MspPrincipal {
            principal_classification: PrincipalClassification::Role as i32,
            principal: role.encode_to_vec(),
        };
        let node = principal_to_node(&p).unwrap();
        assert_eq!(node.get("principalClassification"), Some(&RawNode::from("ROLE")));
        let principal = node.get("principal").unwrap();
        assert_eq!(principal.get("role"), Some(&RawNode::from("ADMIN")));
        assert_eq!(principal.get("mspIdentifier"), Some(&RawNode::from("Org1MSP")));
    }

    #[test]
    fn combined_principal_recurses() {
        let inner = MspPrincipal {
            principal_classification: PrincipalClassification::Anonymity as i32,
            principal: MspIdentityAnonymity { anonymity_type: 1 }.encode_to_vec(),
        };
        let p = MspPrincipal {
            principal_classification: PrincipalClassification::Combined as i32,
            principal: CombinedPrincipal { principals: vec![inner] }.encode_to_vec(),
        };
        let node = principal_to_node(&p).unwrap();
        let principals = node.get("principals").and_then(RawNode::as_list).unwrap();
        assert_eq!(
            principals[0].get("principal").and_then(|n| n.get("anonymityType")),
            Some(&RawNode::from("ANONYMOUS"))
        );
    }

    #[test]
    fn unknown_enum_values_render_as_numbers() {
        let spec = ChaincodeSpec {
            r#type: 99,
            ..Default::default()
        };
        assert_eq!(spec.to_node().get("type"), Some(&RawNode::from(99i32)));
    }
}
