// crates/bacnet-rs/src/appservice/ssm.rs
//! State shared by the client and server transaction state machines.
//!
//! A segmentation state machine owns one confirmed transaction with one
//! peer: the buffered request or response being carved into segments (or
//! reassembled from them), the window bookkeeping, and the retry
//! counters. Transitions record their outputs as effects; the access
//! point that owns the machine routes them and manages the one timer a
//! machine may hold.

use crate::apdu::{Apdu, ComplexAck, ConfirmedRequest};
use crate::device::{DeviceConfig, RecordId};
use crate::error::BacnetError;
use crate::pdu::Address;
use crate::types::Segmentation;
use alloc::vec::Vec;
use log::trace;

/// Transaction states (ASHRAE 135, Clause 5.4.4 and 5.4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsmState {
    Idle,
    SegmentedRequest,
    AwaitConfirmation,
    AwaitResponse,
    SegmentedResponse,
    SegmentedConfirmation,
    Completed,
    Aborted,
}

impl SsmState {
    /// Completed and Aborted are terminal; nothing leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, SsmState::Completed | SsmState::Aborted)
    }
}

/// Timer change requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerChange {
    Stop,
    Restart(u64),
}

/// Outputs recorded by a transition, drained by the access point.
#[derive(Debug, Default)]
pub struct SsmEffects {
    pub to_peer: Vec<Apdu>,
    pub to_app: Vec<Apdu>,
    pub timer: Option<TimerChange>,
}

/// The state common to both sides of the segmentation protocol.
#[derive(Debug)]
pub struct SsmCore {
    pub peer: Address,
    pub invoke_id: Option<u8>,
    pub state: SsmState,
    /// The request or response being segmented or reassembled.
    pub segment_apdu: Option<Apdu>,
    pub segment_size: usize,
    pub segment_count: usize,
    pub retry_count: u8,
    pub segment_retry_count: u8,
    pub sent_all_segments: bool,
    pub last_sequence_number: u8,
    pub initial_sequence_number: u8,
    pub actual_window_size: Option<u8>,
    /// Pinned capability record for the peer, when one is cached.
    pub device_info: Option<RecordId>,

    // Copies of the local configuration, fixed for the lifetime of the
    // transaction. The server side overwrites the max-accepted fields
    // with what the requesting client advertised.
    pub number_of_apdu_retries: u8,
    pub apdu_timeout_ms: u64,
    pub segment_timeout_ms: u64,
    pub segmentation_supported: Segmentation,
    pub max_segments_accepted: Option<u8>,
    pub max_apdu_length_accepted: usize,
    pub proposed_window_size: u8,

    pub effects: SsmEffects,
}

impl SsmCore {
    pub fn new(peer: Address, config: &DeviceConfig, device_info: Option<RecordId>) -> Self {
        SsmCore {
            peer,
            invoke_id: None,
            state: SsmState::Idle,
            segment_apdu: None,
            segment_size: 0,
            segment_count: 0,
            retry_count: 0,
            segment_retry_count: 0,
            sent_all_segments: false,
            last_sequence_number: 0,
            initial_sequence_number: 0,
            actual_window_size: None,
            device_info,
            number_of_apdu_retries: config.number_of_apdu_retries,
            apdu_timeout_ms: config.apdu_timeout_ms,
            segment_timeout_ms: config.segment_timeout_ms,
            segmentation_supported: config.segmentation_supported,
            max_segments_accepted: config.max_segments_accepted,
            max_apdu_length_accepted: config.max_apdu_length_accepted,
            proposed_window_size: config.proposed_window_size,
            effects: SsmEffects::default(),
        }
    }

    /// Change state. The previous timer always stops; a new one starts
    /// when the transition asks for it.
    pub fn set_state(
        &mut self,
        new_state: SsmState,
        timer_ms: Option<u64>,
    ) -> Result<(), BacnetError> {
        if self.state.is_terminal() {
            return Err(BacnetError::InvalidState(
                "transition out of a terminal transaction state",
            ));
        }
        trace!("ssm {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
        self.effects.timer = Some(match timer_ms {
            Some(ms) => TimerChange::Restart(ms),
            None => TimerChange::Stop,
        });
        Ok(())
    }

    pub fn restart_timer(&mut self, timer_ms: u64) {
        self.effects.timer = Some(TimerChange::Restart(timer_ms));
    }

    /// Establish the APDU being segmented or reassembled.
    pub fn set_segmentation_context(&mut self, apdu: Apdu) {
        self.segment_apdu = Some(apdu);
    }

    /// Payload length of the segmentation context.
    pub fn context_data_len(&self) -> usize {
        match &self.segment_apdu {
            Some(Apdu::ConfirmedRequest(request)) => request.data.len(),
            Some(Apdu::ComplexAck(ack)) => ack.data.len(),
            _ => 0,
        }
    }

    /// Compute how many segments the context needs at the current
    /// segment size; always at least one.
    pub fn compute_segment_count(&mut self) {
        let len = self.context_data_len();
        self.segment_count = if len == 0 {
            1
        } else {
            len.div_ceil(self.segment_size)
        };
    }

    /// Build the APDU for segment `index` of the context.
    pub fn get_segment(&self, index: usize) -> Result<Apdu, BacnetError> {
        let context = self
            .segment_apdu
            .as_ref()
            .ok_or(BacnetError::InternalError("no segmentation context"))?;
        if index >= self.segment_count {
            return Err(BacnetError::InternalError("segment index out of range"));
        }

        let segmented = self.segment_count != 1;
        let more_follows = index < self.segment_count - 1;
        let sequence_number = (index % 256) as u8;
        // segment zero advertises the proposal, later ones the agreement
        let window_size = if index == 0 {
            self.proposed_window_size
        } else {
            self.actual_window_size.unwrap_or(self.proposed_window_size)
        };

        let offset = index * self.segment_size;
        let end = (offset + self.segment_size).min(self.context_data_len());

        match context {
            Apdu::ConfirmedRequest(request) => Ok(Apdu::ConfirmedRequest(ConfirmedRequest {
                segmented,
                more_follows,
                segmented_response_accepted: self.segmentation_supported.can_receive(),
                max_segments_accepted: self.max_segments_accepted,
                max_apdu_length_accepted: self.max_apdu_length_accepted,
                invoke_id: self.invoke_id,
                sequence_number: segmented.then_some(sequence_number),
                window_size: segmented.then_some(window_size),
                service: request.service,
                data: request.data[offset..end].to_vec(),
            })),
            Apdu::ComplexAck(ack) => Ok(Apdu::ComplexAck(ComplexAck {
                segmented,
                more_follows,
                invoke_id: ack.invoke_id,
                sequence_number: segmented.then_some(sequence_number),
                window_size: segmented.then_some(window_size),
                service: ack.service,
                data: ack.data[offset..end].to_vec(),
            })),
            _ => Err(BacnetError::InternalError(
                "segmentation context is not a request or complex ack",
            )),
        }
    }

    /// Append the payload of a received segment to the context.
    pub fn append_segment(&mut self, apdu: &Apdu) -> Result<(), BacnetError> {
        let data = match apdu {
            Apdu::ConfirmedRequest(request) => &request.data,
            Apdu::ComplexAck(ack) => &ack.data,
            _ => return Err(BacnetError::InternalError("segment without payload")),
        };
        match &mut self.segment_apdu {
            Some(Apdu::ConfirmedRequest(request)) => request.data.extend_from_slice(data),
            Some(Apdu::ComplexAck(ack)) => ack.data.extend_from_slice(data),
            _ => return Err(BacnetError::InternalError("no segmentation context")),
        }
        Ok(())
    }

    /// Take the reassembled context, with the per-segment control fields
    /// cleared.
    pub fn take_reassembled(&mut self) -> Result<Apdu, BacnetError> {
        let mut apdu = self
            .segment_apdu
            .take()
            .ok_or(BacnetError::InternalError("no segmentation context"))?;
        match &mut apdu {
            Apdu::ConfirmedRequest(request) => {
                request.segmented = false;
                request.more_follows = false;
                request.sequence_number = None;
                request.window_size = None;
            }
            Apdu::ComplexAck(ack) => {
                ack.segmented = false;
                ack.more_follows = false;
                ack.sequence_number = None;
                ack.window_size = None;
            }
            _ => {}
        }
        Ok(apdu)
    }

    /// Whether `seq` falls inside the window that starts at `initial`.
    pub fn in_window(&self, seq: u8, initial: u8) -> bool {
        let window = self.actual_window_size.unwrap_or(1) as u16;
        ((seq as u16 + 256 - initial as u16) % 256) < window
    }

    /// Send segments from `seq` until the window is full or the last
    /// segment has gone out.
    pub fn fill_window(&mut self, seq: usize) -> Result<(), BacnetError> {
        let window = self.actual_window_size.unwrap_or(1) as usize;
        for ix in 0..window {
            let segment = self.get_segment(seq + ix)?;
            let more = match &segment {
                Apdu::ConfirmedRequest(request) => request.more_follows,
                Apdu::ComplexAck(ack) => ack.more_follows,
                _ => false,
            };
            self.effects.to_peer.push(segment);
            if !more {
                self.sent_all_segments = true;
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn core_with_request(data_len: usize, segment_size: usize) -> SsmCore {
        let config = DeviceConfig {
            proposed_window_size: 4,
            segmentation_supported: Segmentation::SegmentedBoth,
            ..DeviceConfig::default()
        };
        let mut core = SsmCore::new(
            Address::local_station_ip([10, 0, 0, 1], 47808),
            &config,
            None,
        );
        core.invoke_id = Some(1);
        let mut request = ConfirmedRequest::new(15, vec![0xAB; data_len]);
        request.invoke_id = Some(1);
        core.set_segmentation_context(Apdu::ConfirmedRequest(request));
        core.segment_size = segment_size;
        core.compute_segment_count();
        core
    }

    #[test]
    fn test_segment_count_rounds_up() {
        assert_eq!(core_with_request(4096, 480).segment_count, 9);
        assert_eq!(core_with_request(480, 480).segment_count, 1);
        assert_eq!(core_with_request(481, 480).segment_count, 2);
        assert_eq!(core_with_request(0, 480).segment_count, 1);
    }

    #[test]
    fn test_get_segment_flags_and_slicing() {
        let core = core_with_request(1000, 480);
        assert_eq!(core.segment_count, 3);

        let first = core.get_segment(0).unwrap();
        let Apdu::ConfirmedRequest(first) = first else {
            panic!("expected a confirmed request");
        };
        assert!(first.segmented);
        assert!(first.more_follows);
        assert_eq!(first.sequence_number, Some(0));
        assert_eq!(first.window_size, Some(4));
        assert_eq!(first.data.len(), 480);

        let last = core.get_segment(2).unwrap();
        let Apdu::ConfirmedRequest(last) = last else {
            panic!("expected a confirmed request");
        };
        assert!(!last.more_follows);
        assert_eq!(last.data.len(), 40);
    }

    #[test]
    fn test_single_segment_has_no_control_fields() {
        let core = core_with_request(100, 480);
        let Apdu::ConfirmedRequest(only) = core.get_segment(0).unwrap() else {
            panic!("expected a confirmed request");
        };
        assert!(!only.segmented);
        assert!(!only.more_follows);
        assert_eq!(only.sequence_number, None);
        assert_eq!(only.window_size, None);
    }

    #[test]
    fn test_window_predicate_wraps_modulo_256() {
        let mut core = core_with_request(100, 480);
        core.actual_window_size = Some(4);
        assert!(core.in_window(0, 0));
        assert!(core.in_window(3, 0));
        assert!(!core.in_window(4, 0));
        // wrap-around
        assert!(core.in_window(1, 254));
        assert!(!core.in_window(2, 254));
        assert!(core.in_window(255, 254));
    }

    #[test]
    fn test_fill_window_stops_at_last_segment() {
        let mut core = core_with_request(1000, 480);
        core.actual_window_size = Some(4);
        core.fill_window(0).unwrap();
        assert_eq!(core.effects.to_peer.len(), 3);
        assert!(core.sent_all_segments);
    }

    #[test]
    fn test_no_transition_out_of_terminal_states() {
        let mut core = core_with_request(100, 480);
        core.set_state(SsmState::Completed, None).unwrap();
        assert!(core.set_state(SsmState::Idle, None).is_err());
        assert_eq!(core.state, SsmState::Completed);
    }

    #[test]
    fn test_append_and_reassemble() {
        let config = DeviceConfig::default();
        let mut core = SsmCore::new(
            Address::local_station_ip([10, 0, 0, 1], 47808),
            &config,
            None,
        );
        let mut first = ComplexAck::new(1, 12, vec![1, 2]);
        first.segmented = true;
        first.sequence_number = Some(0);
        first.window_size = Some(2);
        core.set_segmentation_context(Apdu::ComplexAck(first));
        core.append_segment(&Apdu::ComplexAck(ComplexAck::new(1, 12, vec![3, 4])))
            .unwrap();

        let Apdu::ComplexAck(whole) = core.take_reassembled().unwrap() else {
            panic!("expected a complex ack");
        };
        assert_eq!(whole.data, vec![1, 2, 3, 4]);
        assert!(!whole.segmented);
        assert_eq!(whole.sequence_number, None);
    }
}
