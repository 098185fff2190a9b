//! coordinator response models
//!
//! every field the coordinator promises is required; a body that does not
//! match is rejected instead of being partially accepted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// voting mode the poll was deployed with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum VoteMode {
    /// quadratic voting
    Qv,
    /// one credit, one vote
    NonQv,
    /// all credits on a single option
    Full,
}

impl TryFrom<u8> for VoteMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(VoteMode::Qv),
            1 => Ok(VoteMode::NonQv),
            2 => Ok(VoteMode::Full),
            other => Err(format!("unknown vote mode {}", other)),
        }
    }
}

impl From<VoteMode> for u8 {
    fn from(mode: VoteMode) -> u8 {
        match mode {
            VoteMode::Qv => 0,
            VoteMode::NonQv => 1,
            VoteMode::Full => 2,
        }
    }
}

impl fmt::Display for VoteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteMode::Qv => write!(f, "qv"),
            VoteMode::NonQv => write!(f, "non-qv"),
            VoteMode::Full => write!(f, "full"),
        }
    }
}

/// big integer as it appears in coordinator json (decimal string or number)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BigIntValue {
    Text(String),
    Number(serde_json::Number),
}

/// a circuit input: scalar or arbitrarily nested list of scalars
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CircuitInput {
    Scalar(BigIntValue),
    List(Vec<CircuitInput>),
}

/// snarkjs groth16 proof
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Groth16Proof {
    pub pi_a: Vec<String>,
    pub pi_b: Vec<Vec<String>>,
    pub pi_c: Vec<String>,
    pub protocol: String,
    pub curve: String,
}

/// proof with bigint coordinates and no metadata
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnarkProof {
    pub pi_a: Vec<BigIntValue>,
    pub pi_b: Vec<Vec<BigIntValue>>,
    pub pi_c: Vec<BigIntValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProofData {
    Groth16(Groth16Proof),
    Snark(SnarkProof),
}

/// one process or tally proof
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proof {
    pub proof: ProofData,
    pub circuit_inputs: BTreeMap<String, CircuitInput>,
    pub public_inputs: Vec<String>,
}

/// per-option tally with its salted commitment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyResults {
    pub tally: Vec<String>,
    pub salt: String,
    pub commitment: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentVoiceCredits {
    pub spent: String,
    pub salt: String,
    pub commitment: String,
}

/// tally file produced by the coordinator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyData {
    pub maci: String,
    pub poll_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub mode: VoteMode,
    pub tally_address: String,
    pub new_tally_commitment: String,
    pub results: TallyResults,
    pub total_spent_voice_credits: SpentVoiceCredits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_vote_option_spent_voice_credits: Option<TallyResults>,
}

/// body of a successful `/proof/generate`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub process_proofs: Vec<Proof>,
    pub tally_proofs: Vec<Proof>,
    pub tally_data: TallyData,
}

/// body of a successful `/proof/submit`
pub type SubmitResponse = TallyData;

/// error body of a non-OK coordinator response
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tally_data_json() -> serde_json::Value {
        json!({
            "maci": "0x00000000000000000000000000000000000000aa",
            "pollId": "3",
            "network": "sepolia",
            "chainId": "11155111",
            "mode": 1,
            "tallyAddress": "0x00000000000000000000000000000000000000cc",
            "newTallyCommitment": "0x1234",
            "results": {
                "tally": ["5", "2", "1"],
                "salt": "0xabc",
                "commitment": "0xdef"
            },
            "totalSpentVoiceCredits": {
                "spent": "8",
                "salt": "0x01",
                "commitment": "0x02"
            }
        })
    }

    #[test]
    fn test_generate_response_parses() {
        let body = json!({
            "processProofs": [],
            "tallyProofs": [],
            "tallyData": tally_data_json(),
        });
        let parsed: GenerateResponse = serde_json::from_value(body).unwrap();
        assert!(parsed.process_proofs.is_empty());
        assert_eq!(parsed.tally_data.results.tally, vec!["5", "2", "1"]);
        assert_eq!(parsed.tally_data.mode, VoteMode::NonQv);
        assert!(parsed.tally_data.per_vote_option_spent_voice_credits.is_none());
    }

    #[test]
    fn test_missing_tally_rejected() {
        let mut tally = tally_data_json();
        tally["results"].as_object_mut().unwrap().remove("tally");
        let body = json!({
            "processProofs": [],
            "tallyProofs": [],
            "tallyData": tally,
        });
        assert!(serde_json::from_value::<GenerateResponse>(body).is_err());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let mut tally = tally_data_json();
        tally["mode"] = json!(7);
        assert!(serde_json::from_value::<TallyData>(tally).is_err());
    }

    #[test]
    fn test_proof_variants() {
        let groth16 = json!({
            "proof": {
                "pi_a": ["1", "2", "1"],
                "pi_b": [["1", "2"], ["3", "4"], ["1", "0"]],
                "pi_c": ["5", "6", "1"],
                "protocol": "groth16",
                "curve": "bn128"
            },
            "circuitInputs": {
                "inputHash": "123",
                "msgs": [["1", "2"], ["3", "4"]],
                "batchEndIndex": 20
            },
            "publicInputs": ["123"]
        });
        let proof: Proof = serde_json::from_value(groth16).unwrap();
        assert!(matches!(proof.proof, ProofData::Groth16(_)));
        assert!(matches!(
            proof.circuit_inputs.get("msgs"),
            Some(CircuitInput::List(_))
        ));

        let snark = json!({
            "proof": { "pi_a": [1, 2], "pi_b": [[1, 2], [3, 4]], "pi_c": ["5", 6] },
            "circuitInputs": {},
            "publicInputs": []
        });
        let proof: Proof = serde_json::from_value(snark).unwrap();
        assert!(matches!(proof.proof, ProofData::Snark(_)));
    }

    #[test]
    fn test_circuit_input_rejects_objects() {
        let bad = json!({
            "proof": { "pi_a": [], "pi_b": [], "pi_c": [] },
            "circuitInputs": { "x": { "nested": true } },
            "publicInputs": []
        });
        assert!(serde_json::from_value::<Proof>(bad).is_err());
    }
}
