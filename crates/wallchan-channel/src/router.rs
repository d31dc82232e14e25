use bytes::Bytes;
use tracing::warn;
use wallchan_codec::{decode_message, Message};
use wallchan_transport::SharedProtocol;

use crate::client::ChannelClient;
use crate::server::ChannelServer;

/// Feed one inbound buffer to the half of the connection it is meant for.
///
/// Both halves share one transport; decoding once here and routing by kind
/// lets a single subscription serve them, so no buffer is delivered to one
/// half before the other exists. A frame that fails to decode ends the
/// connection.
pub(crate) fn route<C: Send + Sync + 'static>(
    server: &ChannelServer<C>,
    client: &ChannelClient,
    protocol: &SharedProtocol,
    buffer: Bytes,
) {
    match decode_message(buffer) {
        Ok(Message::Request(request)) => server.handle_request(request),
        Ok(Message::Response(response)) => client.handle_response(response),
        Err(err) => {
            warn!(error = %err, "malformed frame; disconnecting");
            protocol.disconnect();
        }
    }
}
