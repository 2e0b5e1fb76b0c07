// crates/bacnet-rs/src/appservice/client.rs
//! Client side of the segmentation protocol: drives one outbound
//! confirmed transaction from first segment to final confirmation.

use crate::apdu::{Apdu, SegmentAck};
use crate::device::DeviceInfoCache;
use crate::error::BacnetError;
use crate::types::AbortReason;
use crate::appservice::ssm::{SsmCore, SsmState};
use log::{debug, trace, warn};

#[derive(Debug)]
pub struct ClientSsm {
    pub core: SsmCore,
}

impl ClientSsm {
    pub fn new(core: SsmCore) -> Self {
        ClientSsm { core }
    }

    /// Abort the transaction, returning the APDU to route.
    fn abort(&mut self, reason: AbortReason) -> Result<Apdu, BacnetError> {
        debug!("client transaction abort: {:?}", reason);
        self.core.set_state(SsmState::Aborted, None)?;
        Ok(Apdu::Abort(crate::apdu::AbortPdu {
            server: false,
            invoke_id: self.core.invoke_id.unwrap_or(0),
            reason,
        }))
    }

    /// A new (or retried) request from the application starts the
    /// transaction rolling.
    pub fn indication(&mut self, apdu: Apdu, cache: &DeviceInfoCache) -> Result<(), BacnetError> {
        let request = match &apdu {
            Apdu::ConfirmedRequest(request) => request,
            _ => {
                return Err(BacnetError::InternalError(
                    "client transaction needs a confirmed request",
                ))
            }
        };
        self.core.invoke_id = request.invoke_id;

        // The segment size is the smaller of the largest packet that can
        // reach the peer and the largest APDU it accepts; with no cached
        // record, assume it mirrors our own limit.
        let info = self.core.device_info.and_then(|id| cache.get(id));
        self.core.segment_size = match info {
            None => self.core.max_apdu_length_accepted,
            Some(info) => match info.max_npdu_length {
                None => info.max_apdu_length_accepted,
                Some(max_npdu) => max_npdu.min(info.max_apdu_length_accepted),
            },
        }
        // a peer advertising less than the protocol minimum is broken
        .max(50);
        trace!("segment size {}", self.core.segment_size);

        self.core.set_segmentation_context(apdu);
        self.core.compute_segment_count();
        trace!("segment count {}", self.core.segment_count);

        if self.core.segment_count > 1 {
            if !self.core.segmentation_supported.can_transmit() {
                debug!("local device cannot send segmented requests");
                let abort = self.abort(AbortReason::SegmentationNotSupported)?;
                self.core.effects.to_app.push(abort);
                return Ok(());
            }
            match info {
                None => debug!("no peer record to check segmentation support against"),
                Some(info) => {
                    if !info.segmentation_supported.can_receive() {
                        debug!("peer cannot receive segmented requests");
                        let abort = self.abort(AbortReason::SegmentationNotSupported)?;
                        self.core.effects.to_app.push(abort);
                        return Ok(());
                    }
                    if let Some(max_segments) = info.max_segments_accepted {
                        if self.core.segment_count > max_segments as usize {
                            debug!("peer cannot receive {} segments", self.core.segment_count);
                            let abort = self.abort(AbortReason::ApduTooLong)?;
                            self.core.effects.to_app.push(abort);
                            return Ok(());
                        }
                    }
                }
            }
        }

        if self.core.segment_count == 1 {
            self.core.sent_all_segments = true;
            self.core.retry_count = 0;
            self.core
                .set_state(SsmState::AwaitConfirmation, Some(self.core.apdu_timeout_ms))?;
        } else {
            self.core.sent_all_segments = false;
            self.core.retry_count = 0;
            self.core.segment_retry_count = 0;
            self.core.initial_sequence_number = 0;
            self.core.actual_window_size = None;
            self.core
                .set_state(SsmState::SegmentedRequest, Some(self.core.segment_timeout_ms))?;
        }

        let first = self.core.get_segment(0)?;
        self.core.effects.to_peer.push(first);
        Ok(())
    }

    /// Upstream traffic for this transaction.
    pub fn confirmation(&mut self, apdu: Apdu) -> Result<(), BacnetError> {
        match self.core.state {
            SsmState::SegmentedRequest => self.segmented_request(apdu),
            SsmState::AwaitConfirmation => self.await_confirmation(apdu),
            SsmState::SegmentedConfirmation => self.segmented_confirmation(apdu),
            _ => Err(BacnetError::InvalidState(
                "client transaction received traffic in an unexpected state",
            )),
        }
    }

    /// The installed timer expired.
    pub fn timeout(&mut self, cache: &DeviceInfoCache) -> Result<(), BacnetError> {
        match self.core.state {
            SsmState::SegmentedRequest => self.segmented_request_timeout(),
            SsmState::AwaitConfirmation => self.await_confirmation_timeout(cache),
            SsmState::SegmentedConfirmation => self.segmented_confirmation_timeout(),
            SsmState::Completed | SsmState::Aborted => Ok(()),
            _ => Err(BacnetError::InvalidState(
                "client transaction timer in an unexpected state",
            )),
        }
    }

    fn segment_ack(&self, negative_ack: bool, sequence_number: u8) -> Apdu {
        Apdu::SegmentAck(SegmentAck {
            negative_ack,
            server: false,
            invoke_id: self.core.invoke_id.unwrap_or(0),
            sequence_number,
            actual_window_size: self.core.actual_window_size.unwrap_or(1),
        })
    }

    fn segmented_request(&mut self, apdu: Apdu) -> Result<(), BacnetError> {
        match apdu {
            // peer is ready for the next window
            Apdu::SegmentAck(ack) => {
                self.core.actual_window_size = Some(ack.actual_window_size);

                if !self.core.in_window(ack.sequence_number, self.core.initial_sequence_number) {
                    trace!("duplicate segment ack, not in window");
                    self.core.restart_timer(self.core.segment_timeout_ms);
                } else if self.core.sent_all_segments {
                    trace!("final segment ack");
                    self.core
                        .set_state(SsmState::AwaitConfirmation, Some(self.core.apdu_timeout_ms))?;
                } else {
                    self.core.initial_sequence_number =
                        ack.sequence_number.wrapping_add(1);
                    self.core.segment_retry_count = 0;
                    self.core
                        .fill_window(self.core.initial_sequence_number as usize)?;
                    self.core.restart_timer(self.core.segment_timeout_ms);
                }
                Ok(())
            }
            Apdu::SimpleAck(_) => {
                if !self.core.sent_all_segments {
                    // the peer jumped the gun
                    let abort = self.abort(AbortReason::InvalidApduInThisState)?;
                    self.core.effects.to_peer.push(abort.clone());
                    self.core.effects.to_app.push(abort);
                } else {
                    self.core.set_state(SsmState::Completed, None)?;
                    self.core.effects.to_app.push(apdu);
                }
                Ok(())
            }
            Apdu::ComplexAck(ref ack) => {
                if !self.core.sent_all_segments {
                    let abort = self.abort(AbortReason::InvalidApduInThisState)?;
                    self.core.effects.to_peer.push(abort.clone());
                    self.core.effects.to_app.push(abort);
                } else if !ack.segmented {
                    self.core.set_state(SsmState::Completed, None)?;
                    self.core.effects.to_app.push(apdu);
                } else {
                    let window = ack
                        .window_size
                        .unwrap_or(1)
                        .min(self.core.proposed_window_size);
                    self.core.set_segmentation_context(apdu);
                    self.core.actual_window_size = Some(window);
                    self.core.last_sequence_number = 0;
                    self.core.initial_sequence_number = 0;
                    self.core.set_state(
                        SsmState::SegmentedConfirmation,
                        Some(self.core.segment_timeout_ms),
                    )?;
                }
                Ok(())
            }
            Apdu::Error(_) | Apdu::Reject(_) | Apdu::Abort(_) => {
                self.core.set_state(SsmState::Completed, None)?;
                self.core.effects.to_app.push(apdu);
                Ok(())
            }
            _ => Err(BacnetError::InvalidState(
                "unexpected APDU while sending a segmented request",
            )),
        }
    }

    fn segmented_request_timeout(&mut self) -> Result<(), BacnetError> {
        if self.core.segment_retry_count < self.core.number_of_apdu_retries {
            trace!("retrying segmented request window");
            self.core.segment_retry_count += 1;
            self.core.restart_timer(self.core.segment_timeout_ms);
            if self.core.initial_sequence_number == 0 {
                let first = self.core.get_segment(0)?;
                self.core.effects.to_peer.push(first);
            } else {
                self.core
                    .fill_window(self.core.initial_sequence_number as usize)?;
            }
        } else {
            debug!("no response to segmented request");
            let abort = self.abort(AbortReason::NoResponse)?;
            self.core.effects.to_app.push(abort);
        }
        Ok(())
    }

    fn await_confirmation(&mut self, apdu: Apdu) -> Result<(), BacnetError> {
        match apdu {
            Apdu::Abort(_) => {
                debug!("server aborted the transaction");
                self.core.set_state(SsmState::Aborted, None)?;
                self.core.effects.to_app.push(apdu);
                Ok(())
            }
            Apdu::SimpleAck(_) | Apdu::Error(_) | Apdu::Reject(_) => {
                self.core.set_state(SsmState::Completed, None)?;
                self.core.effects.to_app.push(apdu);
                Ok(())
            }
            Apdu::ComplexAck(ref ack) => {
                if !ack.segmented {
                    self.core.set_state(SsmState::Completed, None)?;
                    self.core.effects.to_app.push(apdu);
                } else if !self.core.segmentation_supported.can_receive() {
                    debug!("local device cannot receive segmented responses");
                    let abort = self.abort(AbortReason::SegmentationNotSupported)?;
                    self.core.effects.to_app.push(abort);
                } else if ack.sequence_number == Some(0) {
                    self.core.actual_window_size = ack.window_size;
                    self.core.last_sequence_number = 0;
                    self.core.initial_sequence_number = 0;
                    self.core.set_segmentation_context(apdu);
                    self.core.set_state(
                        SsmState::SegmentedConfirmation,
                        Some(self.core.segment_timeout_ms),
                    )?;
                    let ack = self.segment_ack(false, 0);
                    self.core.effects.to_peer.push(ack);
                } else {
                    let abort = self.abort(AbortReason::InvalidApduInThisState)?;
                    self.core.effects.to_peer.push(abort.clone());
                    self.core.effects.to_app.push(abort);
                }
                Ok(())
            }
            Apdu::SegmentAck(_) => {
                warn!("segment ack while awaiting confirmation");
                self.core.restart_timer(self.core.segment_timeout_ms);
                Ok(())
            }
            _ => Err(BacnetError::InvalidState(
                "unexpected APDU while awaiting confirmation",
            )),
        }
    }

    fn await_confirmation_timeout(&mut self, cache: &DeviceInfoCache) -> Result<(), BacnetError> {
        if self.core.retry_count < self.core.number_of_apdu_retries {
            self.core.retry_count += 1;
            trace!(
                "no response, retry {} of {}",
                self.core.retry_count, self.core.number_of_apdu_retries
            );

            // Re-enter as if the application had just handed us the
            // request; the retry count survives the re-initialisation.
            let saved_retry_count = self.core.retry_count;
            let request = self
                .core
                .segment_apdu
                .clone()
                .ok_or(BacnetError::InternalError("retry without a saved request"))?;
            self.indication(request, cache)?;
            self.core.retry_count = saved_retry_count;
        } else {
            debug!("retry count exceeded");
            let abort = self.abort(AbortReason::NoResponse)?;
            self.core.effects.to_app.push(abort);
        }
        Ok(())
    }

    fn segmented_confirmation(&mut self, apdu: Apdu) -> Result<(), BacnetError> {
        let ack = match &apdu {
            Apdu::ComplexAck(ack) if ack.segmented => ack,
            _ => {
                let abort = self.abort(AbortReason::InvalidApduInThisState)?;
                self.core.effects.to_peer.push(abort.clone());
                self.core.effects.to_app.push(abort);
                return Ok(());
            }
        };

        let expected = self.core.last_sequence_number.wrapping_add(1);
        if ack.sequence_number != Some(expected) {
            debug!(
                "segment {:?} received out of order, should be {}",
                ack.sequence_number, expected
            );
            self.core.restart_timer(self.core.segment_timeout_ms);
            let nak = self.segment_ack(true, self.core.last_sequence_number);
            self.core.effects.to_peer.push(nak);
            return Ok(());
        }

        let more_follows = ack.more_follows;
        let sequence_number = expected;
        self.core.append_segment(&apdu)?;
        self.core.last_sequence_number = sequence_number;

        if !more_follows {
            trace!("last segment of the confirmation");
            let final_ack = self.segment_ack(false, self.core.last_sequence_number);
            self.core.effects.to_peer.push(final_ack);
            self.core.set_state(SsmState::Completed, None)?;
            let whole = self.core.take_reassembled()?;
            self.core.effects.to_app.push(whole);
        } else if sequence_number
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

    fn segmented_confirmation_timeout(&mut self) -> Result<(), BacnetError> {
        debug!("segmented confirmation timed out");
        let abort = self.abort(AbortReason::NoResponse)?;
        self.core.effects.to_app.push(abort);
        Ok(())
    }
}
