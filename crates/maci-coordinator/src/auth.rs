//! coordinator authorization header

use crate::abi::keccak256;
use crate::error::Result;
use crate::rpc::ChainProvider;

/// the fixed message the coordinator expects to be signed
pub const AUTH_MESSAGE: &str = "message";

/// eip-191 personal message digest
pub fn eip191_digest(message: &str) -> [u8; 32] {
    let mut data = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    data.extend_from_slice(message.as_bytes());
    keccak256(&data)
}

/// `Bearer <signature>:<digest>` signed by the provider's account
pub async fn authorization_header(provider: &dyn ChainProvider) -> Result<String> {
    let signature = provider.sign_message(AUTH_MESSAGE).await?;
    Ok(format!(
        "Bearer {}:{}",
        signature,
        hex::encode(eip191_digest(AUTH_MESSAGE))
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Address;
    use crate::error::Error;
    use crate::sim::SimulatedChain;

    #[test]
    fn test_eip191_vectors() {
        assert_eq!(
            hex::encode(eip191_digest("Hello World")),
            "a1de988600a42c4b4ab089b619297c17d53cffae5d5120d82d8a92d0bb3b78f2"
        );
        assert_eq!(
            hex::encode(eip191_digest(AUTH_MESSAGE)),
            "7f6c0e5c497ded52462ec18daeb1c94cefa11cd6949ebdb7074b2a32cac13fba"
        );
    }

    #[tokio::test]
    async fn test_header_shape() {
        let chain = SimulatedChain::new(0, 1).with_signer(Address([3; 20]));
        let header = authorization_header(&chain).await.unwrap();
        let token = header.strip_prefix("Bearer 0x").unwrap();
        let (signature, digest) = token.split_once(':').unwrap();
        assert_eq!(signature.len(), 130);
        assert_eq!(digest, hex::encode(eip191_digest(AUTH_MESSAGE)));
    }

    #[tokio::test]
    async fn test_header_needs_signer() {
        let chain = SimulatedChain::new(0, 1);
        assert!(matches!(
            authorization_header(&chain).await,
            Err(Error::NoSigner)
        ));
    }
}
