// crates/bacnet-rs/src/appservice/server.rs
//! Server side of the segmentation protocol: accepts one inbound
//! confirmed transaction, hands the reassembled request to the
//! application, and carries its response back, segmenting if needed.

use crate::apdu::{Apdu, SegmentAck};
use crate::device::DeviceInfoCache;
use crate::error::BacnetError;
use crate::types::{AbortReason, Segmentation};
use crate::appservice::ssm::{SsmCore, SsmState};
use log::{debug, trace, warn};

#[derive(Debug)]
pub struct ServerSsm {
    pub core: SsmCore,
    /// How long to wait for the application before giving up.
    application_timeout_ms: u64,
    /// Whether the requesting client can take a segmented response.
    segmented_response_accepted: bool,
}

impl ServerSsm {
    pub fn new(core: SsmCore, application_timeout_ms: u64) -> Self {
        ServerSsm {
            core,
            application_timeout_ms,
            segmented_response_accepted: false,
        }
    }

    /// Abort the transaction, returning the APDU to route. The peer is
    /// told; the application is not.
    fn abort(&mut self, reason: AbortReason) -> Result<Apdu, BacnetError> {
        debug!("server transaction abort: {:?}", reason);
        self.core.set_state(SsmState::Aborted, None)?;
        Ok(Apdu::Abort(crate::apdu::AbortPdu {
            server: true,
            invoke_id: self.core.invoke_id.unwrap_or(0),
            reason,
        }))
    }

    fn segment_ack(&self, negative_ack: bool, sequence_number: u8) -> Apdu {
        Apdu::SegmentAck(SegmentAck {
            negative_ack,
            server: true,
            invoke_id: self.core.invoke_id.unwrap_or(0),
            sequence_number,
            actual_window_size: self.core.actual_window_size.unwrap_or(1),
        })
    }

    /// Traffic from the peer for this transaction.
    pub fn indication(
        &mut self,
        apdu: Apdu,
        cache: &mut DeviceInfoCache,
    ) -> Result<(), BacnetError> {
        match self.core.state {
            SsmState::Idle => self.idle(apdu, cache),
            SsmState::SegmentedRequest => self.segmented_request(apdu),
            SsmState::AwaitResponse => self.await_response(apdu),
            SsmState::SegmentedResponse => self.segmented_response(apdu),
            _ => {
                debug!("traffic in state {:?} dropped", self.core.state);
                Ok(())
            }
        }
    }

    /// The application's response to the request this machine forwarded.
    pub fn confirmation(&mut self, apdu: Apdu, cache: &DeviceInfoCache) -> Result<(), BacnetError> {
        if self.core.state != SsmState::AwaitResponse {
            warn!("response while not expecting one");
        }

        match apdu {
            Apdu::Abort(_) => {
                self.core.set_state(SsmState::Aborted, None)?;
                self.core.effects.to_peer.push(apdu);
                Ok(())
            }
            Apdu::SimpleAck(_) | Apdu::Error(_) | Apdu::Reject(_) => {
                self.core.set_state(SsmState::Completed, None)?;
                self.core.effects.to_peer.push(apdu);
                Ok(())
            }
            Apdu::ComplexAck(_) => self.complex_ack_response(apdu, cache),
            _ => Err(BacnetError::InvalidState(
                "application response must be an ack, error, reject or abort",
            )),
        }
    }

    fn complex_ack_response(
        &mut self,
        apdu: Apdu,
        cache: &DeviceInfoCache,
    ) -> Result<(), BacnetError> {
        // The size of each response segment is bounded by what fits in
        // one NPDU to the client and what the client will accept, which
        // its request advertised.
        let info = self.core.device_info.and_then(|id| cache.get(id));
        self.core.segment_size = match info.and_then(|info| info.max_npdu_length) {
            None => self.core.max_apdu_length_accepted,
            Some(max_npdu) => max_npdu.min(self.core.max_apdu_length_accepted),
        }
        // a client advertising less than the protocol minimum is broken
        .max(50);
        trace!("segment size {}", self.core.segment_size);

        self.core.set_segmentation_context(apdu);
        self.core.compute_segment_count();
        trace!("segment count {}", self.core.segment_count);

        if self.core.segment_count > 1 {
            if !self.core.segmentation_supported.can_transmit() {
                debug!("local device cannot send segmented responses");
                let abort = self.abort(AbortReason::SegmentationNotSupported)?;
                self.core.effects.to_peer.push(abort);
                return Ok(());
            }
            if !self.segmented_response_accepted {
                debug!("client cannot receive segmented responses");
                let abort = self.abort(AbortReason::SegmentationNotSupported)?;
                self.core.effects.to_peer.push(abort);
                return Ok(());
            }
            if let Some(max_segments) = self.core.max_segments_accepted {
                if self.core.segment_count > max_segments as usize {
                    debug!("client cannot receive {} segments", self.core.segment_count);
                    let abort = self.abort(AbortReason::ApduTooLong)?;
                    self.core.effects.to_peer.push(abort);
                    return Ok(());
                }
            }
        }

        self.core.segment_retry_count = 0;
        self.core.initial_sequence_number = 0;
        self.core.actual_window_size = None;

        if self.core.segment_count == 1 {
            let whole = self.core.take_reassembled()?;
            self.core.effects.to_peer.push(whole);
            self.core.set_state(SsmState::Completed, None)?;
        } else {
            let first = self.core.get_segment(0)?;
            self.core.effects.to_peer.push(first);
            self.core
                .set_state(SsmState::SegmentedResponse, Some(self.core.segment_timeout_ms))?;
        }
        Ok(())
    }

    /// The installed timer expired.
    pub fn timeout(&mut self) -> Result<(), BacnetError> {
        match self.core.state {
            SsmState::SegmentedRequest => {
                // the client stopped sending segments
                debug!("segmented request abandoned by client");
                self.core.set_state(SsmState::Aborted, None)
            }
            SsmState::AwaitResponse => {
                // The application never answered; the client has
                // probably long since given up. Let it know so it can
                // stop working on the request.
                debug!("application response timeout");
                let abort = self.abort(AbortReason::ServerTimeout)?;
                self.core.effects.to_app.push(abort);
                Ok(())
            }
            SsmState::SegmentedResponse => {
                if self.core.segment_retry_count < self.core.number_of_apdu_retries {
                    self.core.segment_retry_count += 1;
                    self.core.restart_timer(self.core.segment_timeout_ms);
                    self.core
                        .fill_window(self.core.initial_sequence_number as usize)?;
                    Ok(())
                } else {
                    debug!("client stopped acknowledging response segments");
                    self.core.set_state(SsmState::Aborted, None)
                }
            }
            SsmState::Completed | SsmState::Aborted => Ok(()),
            _ => Err(BacnetError::InvalidState(
                "server transaction timer in an unexpected state",
            )),
        }
    }

    fn idle(&mut self, apdu: Apdu, cache: &mut DeviceInfoCache) -> Result<(), BacnetError> {
        let request = match &apdu {
            Apdu::ConfirmedRequest(request) => request,
            _ => {
                return Err(BacnetError::InvalidState(
                    "server transaction needs a confirmed request",
                ))
            }
        };

        self.core.invoke_id = request.invoke_id;
        self.segmented_response_accepted = request.segmented_response_accepted;

        // A client that advertises segmented-response-accepted has just
        // proven it can receive segments; upgrade a stale cache record.
        if request.segmented_response_accepted {
            if let Some(id) = self.core.device_info {
                let upgraded = match cache.get(id).map(|info| info.segmentation_supported) {
                    Some(Segmentation::NoSegmentation) => Some(Segmentation::SegmentedReceive),
                    Some(Segmentation::SegmentedTransmit) => Some(Segmentation::SegmentedBoth),
                    _ => None,
                };
                if let Some(segmentation) = upgraded {
                    trace!("upgrading cached peer segmentation to {:?}", segmentation);
                    if let Some(info) = cache.get_mut(id) {
                        info.segmentation_supported = segmentation;
                    }
                    cache.update_record(id);
                }
            }
        }

        // Prefer the cached record's APDU limit over the wire field when
        // the record knows better; it came from an I-Am.
        self.core.max_apdu_length_accepted = request.max_apdu_length_accepted;
        if let Some(info) = self.core.device_info.and_then(|id| cache.get(id)) {
            if info.max_apdu_length_accepted < self.core.max_apdu_length_accepted {
                debug!("request advertises more than the cached record allows");
            } else {
                self.core.max_apdu_length_accepted = info.max_apdu_length_accepted;
            }
        }
        self.core.max_segments_accepted = request.max_segments_accepted;

        if !request.segmented {
            self.core
                .set_state(SsmState::AwaitResponse, Some(self.application_timeout_ms))?;
            self.core.effects.to_app.push(apdu);
            return Ok(());
        }

        if !self.core.segmentation_supported.can_receive() {
            let abort = self.abort(AbortReason::SegmentationNotSupported)?;
            self.core.effects.to_peer.push(abort);
            return Ok(());
        }

        // The window is the smaller of the client's proposal and ours.
        let window = request
            .window_size
            .unwrap_or(1)
            .min(self.core.proposed_window_size);
        self.core.actual_window_size = Some(window);
        self.core.last_sequence_number = 0;
        self.core.initial_sequence_number = 0;
        self.core.set_segmentation_context(apdu);
        self.core
            .set_state(SsmState::SegmentedRequest, Some(self.core.segment_timeout_ms))?;

        let ack = self.segment_ack(false, 0);
        self.core.effects.to_peer.push(ack);
        Ok(())
    }

    fn segmented_request(&mut self, apdu: Apdu) -> Result<(), BacnetError> {
        let request = match &apdu {
            Apdu::Abort(_) => {
                // nothing has reached the application yet
                debug!("client aborted its segmented request");
                return self.core.set_state(SsmState::Completed, None);
            }
            Apdu::ConfirmedRequest(request) if request.segmented => request,
            _ => {
                let abort = self.abort(AbortReason::InvalidApduInThisState)?;
                self.core.effects.to_peer.push(abort.clone());
                self.core.effects.to_app.push(abort);
                return Ok(());
            }
        };

        let expected = self.core.last_sequence_number.wrapping_add(1);
        if request.sequence_number != Some(expected) {
            debug!(
                "segment {:?} received out of order, should be {}",
                request.sequence_number, expected
            );
            self.core.restart_timer(self.core.segment_timeout_ms);
            let nak = self.segment_ack(true, self.core.last_sequence_number);
            self.core.effects.to_peer.push(nak);
            return Ok(());
        }

        let more_follows = request.more_follows;
        self.core.append_segment(&apdu)?;
        self.core.last_sequence_number = expected;

        if !more_follows {
            trace!("last segment of the request");
            let final_ack = self.segment_ack(false, self.core.last_sequence_number);
            self.core.effects.to_peer.push(final_ack);

            self.core
                .set_state(SsmState::AwaitResponse, Some(self.application_timeout_ms))?;
            let whole = self.core.take_reassembled()?;
            self.core.effects.to_app.push(whole);
        } else if expected
            == self
                .core
                .initial_sequence_number
                .wrapping_add(self.core.actual_window_size.unwrap_or(1))
        {
            trace!("last segment in the group");
            self.core.initial_sequence_number = self.core.last_sequence_number;
            self.core.restart_timer(self.core.segment_timeout_ms);
            let ack = self.segment_ack(false, self.core.last_sequence_number);
            self.core.effects.to_peer.push(ack);
        } else {
            self.core.restart_timer(self.core.segment_timeout_ms);
        }
        Ok(())
    }

    fn await_response(&mut self, apdu: Apdu) -> Result<(), BacnetError> {
        match apdu {
            Apdu::ConfirmedRequest(_) => {
                // retransmission; the response is still being formed
                debug!("client is trying this request again");
                Ok(())
            }
            Apdu::Abort(_) => {
                debug!("client aborted while waiting for the application");
                self.core.set_state(SsmState::Aborted, None)?;
                self.core.effects.to_app.push(apdu);
                Ok(())
            }
            _ => Err(BacnetError::InvalidState(
                "unexpected APDU while awaiting the application response",
            )),
        }
    }

    fn segmented_response(&mut self, apdu: Apdu) -> Result<(), BacnetError> {
        match apdu {
            Apdu::SegmentAck(ack) => {
                self.core.actual_window_size = Some(ack.actual_window_size);

                if !self.core.in_window(ack.sequence_number, self.core.initial_sequence_number) {
                    trace!("duplicate segment ack, not in window");
                    self.core.restart_timer(self.core.segment_timeout_ms);
                } else if self.core.sent_all_segments {
                    trace!("final segment ack, response delivered");
                    self.core.set_state(SsmState::Completed, None)?;
                } else {
                    self.core.initial_sequence_number = ack.sequence_number.wrapping_add(1);
                    self.core.segment_retry_count = 0;
                    self.core
                        .fill_window(self.core.initial_sequence_number as usize)?;
                    self.core.restart_timer(self.core.segment_timeout_ms);
                }
                Ok(())
            }
            Apdu::Abort(_) => {
                debug!("client aborted the segmented response");
                self.core.set_state(SsmState::Completed, None)
            }
            _ => Err(BacnetError::InvalidState(
                "unexpected APDU while sending a segmented response",
            )),
        }
    }
}
