//! RFCOMM streams on the Serial Port Profile through BlueZ.

use std::time::Duration;

use uuid::Uuid;

use super::{Connection, Listener};
use crate::error::TransportError;

/// Serial Port Profile service class.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_0080_5F9B_34FB);

#[cfg(feature = "bluetooth")]
mod bluez {
    use std::time::Duration;

    use async_trait::async_trait;
    use bluer::rfcomm::{Profile, ProfileHandle, Role};
    use futures_util::StreamExt;

    use super::SPP_UUID;
    use crate::error::TransportError;
    use crate::transport::{Connection, Listener};

    fn bt_err(e: bluer::Error) -> TransportError {
        TransportError::Bluetooth(e.to_string())
    }

    fn profile(role: Role) -> Profile {
        Profile {
            uuid: SPP_UUID,
            name: Some("MicYou".to_string()),
            role: Some(role),
            require_authentication: Some(false),
            require_authorization: Some(false),
            ..Default::default()
        }
    }

    async fn session() -> Result<(bluer::Session, bluer::Adapter), TransportError> {
        let session = bluer::Session::new().await.map_err(bt_err)?;
        let adapter = session.default_adapter().await.map_err(bt_err)?;
        adapter.set_powered(true).await.map_err(bt_err)?;
        Ok((session, adapter))
    }

    pub async fn connect(address: &str, timeout: Duration) -> Result<Connection, TransportError> {
        let addr: bluer::Address = address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;
        let (session, adapter) = session().await?;
        let mut handle = session
            .register_profile(profile(Role::Client))
            .await
            .map_err(bt_err)?;
        let device = adapter.device(addr).map_err(bt_err)?;

        let establish = async {
            tokio::select! {
                res = device.connect_profile(&SPP_UUID) => {
                    res.map_err(bt_err)?;
                    let req = handle
                        .next()
                        .await
                        .ok_or_else(|| TransportError::Bluetooth("profile closed".to_string()))?;
                    req.accept().map_err(|e| TransportError::Bluetooth(e.to_string()))
                }
                req = handle.next() => {
                    let req = req.ok_or_else(|| TransportError::Bluetooth("profile closed".to_string()))?;
                    req.accept().map_err(|e| TransportError::Bluetooth(e.to_string()))
                }
            }
        };

        let stream = tokio::time::timeout(timeout, establish)
            .await
            .map_err(|_| TransportError::Timeout(address.to_string()))??;
        log::info!("RFCOMM connected to {}", addr);
        Ok(Connection::new(stream, addr.to_string()))
    }

    /// Advertised SPP server.
    pub struct RfcommServer {
        _session: bluer::Session,
        handle: ProfileHandle,
        adapter_name: String,
    }

    pub async fn listen() -> Result<Box<dyn Listener>, TransportError> {
        let (session, adapter) = session().await?;
        adapter.set_discoverable(true).await.map_err(bt_err)?;
        let handle = session
            .register_profile(profile(Role::Server))
            .await
            .map_err(bt_err)?;
        log::info!("RFCOMM service advertised on {}", adapter.name());
        Ok(Box::new(RfcommServer {
            adapter_name: adapter.name().to_string(),
            _session: session,
            handle,
        }))
    }

    #[async_trait]
    impl Listener for RfcommServer {
        async fn accept(&mut self) -> Result<Connection, TransportError> {
            let req = self
                .handle
                .next()
                .await
                .ok_or_else(|| TransportError::Bluetooth("profile unregistered".to_string()))?;
            let peer = req.device().to_string();
            let stream = req
                .accept()
                .map_err(|e| TransportError::Bluetooth(e.to_string()))?;
            Ok(Connection::new(stream, peer))
        }

        fn local_description(&self) -> String {
            format!("rfcomm://{}/{}", self.adapter_name, super::SPP_UUID)
        }
    }
}

#[cfg(feature = "bluetooth")]
pub async fn connect(address: &str, timeout: Duration) -> Result<Connection, TransportError> {
    bluez::connect(address, timeout).await
}

#[cfg(feature = "bluetooth")]
pub async fn listen() -> Result<Box<dyn Listener>, TransportError> {
    bluez::listen().await
}

#[cfg(not(feature = "bluetooth"))]
pub async fn connect(address: &str, _timeout: Duration) -> Result<Connection, TransportError> {
    log::warn!("Bluetooth requested for {} but support is not compiled in", address);
    Err(TransportError::Unsupported("bluetooth"))
}

#[cfg(not(feature = "bluetooth"))]
pub async fn listen() -> Result<Box<dyn Listener>, TransportError> {
    Err(TransportError::Unsupported("bluetooth"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spp_uuid_matches_assigned_number() {
        assert_eq!(
            SPP_UUID.to_string(),
            "00001101-0000-1000-8000-00805f9b34fb"
        );
    }

    #[cfg(not(feature = "bluetooth"))]
    #[tokio::test]
    async fn reports_unsupported_without_bluez() {
        let err = connect("00:11:22:33:44:55", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Unsupported("bluetooth")));
    }
}
