//! DISCONNECT processing

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{Connection, ConnectionError};
use crate::protocol::{Disconnect, ReasonCode};
use crate::session::Client;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// A graceful DISCONNECT: the read loop observes the stop flag and ends
    /// without publishing the will [MQTT-3.14.4-3].
    pub(crate) fn process_disconnect(
        &mut self,
        client: &Arc<Client>,
        disconnect: Disconnect,
    ) -> Result<(), ConnectionError> {
        if let Some(interval) = disconnect.properties.session_expiry_interval {
            let mut props = client.properties.write();
            // a session created with expiry 0 cannot gain one at disconnect
            if interval > 0 && props.session_expiry_interval == 0 {
                return Err(ConnectionError::Reason(ReasonCode::ProtocolError));
            }
            props.session_expiry_interval = interval;
            props.session_expiry_set = true;
        }

        debug!(client = %client.id, reason = %disconnect.reason_code, "client requested disconnect");

        self.broker.cancel_delayed_will(&client.id); // [MQTT-3.1.3-9] [MQTT-3.1.2-8]
        client.stop(None); // [MQTT-3.14.4-2]
        Ok(())
    }
}
