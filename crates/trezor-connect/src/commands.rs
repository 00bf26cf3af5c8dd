//! Single-round device operations.

use crate::error::Result;
use crate::link::Link;
use crate::messages::{
    Address, EthereumAddress, EthereumGetAddress, EthereumGetPublicKey, EthereumMessageSignature,
    EthereumPublicKey, EthereumSignMessage, Features, GetAddress, GetPublicKey, Initialize,
    InputScriptType, MessageSignature, Ping, PublicKey, SignMessage, Success,
};
use crate::session::DeviceSession;
use crate::DeviceError;

impl<L: Link> DeviceSession<L> {
    /// Resets the device's session state and returns its features.
    pub async fn initialize(&mut self) -> Result<Features> {
        let features: Features = self.call(&Initialize { session_id: None }).await?;
        tracing::debug!(
            model = features.model.as_deref().unwrap_or("?"),
            version = ?features.version(),
            "device initialized"
        );
        Ok(features)
    }

    pub async fn ping(&mut self, message: &str, button_protection: bool) -> Result<String> {
        let success: Success = self
            .call(&Ping {
                message: Some(message.to_string()),
                button_protection: Some(button_protection),
            })
            .await?;
        Ok(success.message.unwrap_or_default())
    }

    pub async fn get_public_key(
        &mut self,
        coin_name: &str,
        path: &[u32],
        show_display: bool,
    ) -> Result<PublicKey> {
        self.call(&GetPublicKey {
            address_n: path.to_vec(),
            ecdsa_curve_name: None,
            show_display: Some(show_display),
            coin_name: Some(coin_name.to_string()),
            script_type: InputScriptType::from_path(path).map(|t| t as i32),
        })
        .await
    }

    pub async fn get_address(
        &mut self,
        coin_name: &str,
        path: &[u32],
        show_display: bool,
    ) -> Result<String> {
        let address: Address = self
            .call(&GetAddress {
                address_n: path.to_vec(),
                coin_name: Some(coin_name.to_string()),
                show_display: Some(show_display),
                script_type: InputScriptType::from_path(path).map(|t| t as i32),
            })
            .await?;
        Ok(address.address)
    }

    pub async fn sign_message(
        &mut self,
        coin_name: &str,
        path: &[u32],
        message: &[u8],
    ) -> Result<MessageSignature> {
        self.call(&SignMessage {
            address_n: path.to_vec(),
            message: message.to_vec(),
            coin_name: Some(coin_name.to_string()),
            script_type: InputScriptType::from_path(path).map(|t| t as i32),
        })
        .await
    }

    pub async fn ethereum_get_address(&mut self, path: &[u32], show_display: bool) -> Result<String> {
        let address: EthereumAddress = self
            .call(&EthereumGetAddress {
                address_n: path.to_vec(),
                show_display: Some(show_display),
            })
            .await?;
        match (address.address, address.old_address) {
            (Some(address), _) => Ok(address),
            (None, Some(raw)) => Ok(format!("0x{}", ::hex::encode(raw))),
            (None, None) => Err(DeviceError::Protocol(
                "EthereumAddress carries no address".to_string(),
            )),
        }
    }

    pub async fn ethereum_get_public_key(
        &mut self,
        path: &[u32],
        show_display: bool,
    ) -> Result<EthereumPublicKey> {
        self.call(&EthereumGetPublicKey {
            address_n: path.to_vec(),
            show_display: Some(show_display),
        })
        .await
    }

    pub async fn ethereum_sign_message(
        &mut self,
        path: &[u32],
        message: &[u8],
    ) -> Result<EthereumMessageSignature> {
        self.call(&EthereumSignMessage {
            address_n: path.to_vec(),
            message: message.to_vec(),
        })
        .await
    }
}
