// crates/bacnet-rs/src/appservice/smap.rs
//! The transaction registry between the service access point above and
//! the network layer below: allocates invoke IDs, owns every live
//! segmentation state machine, routes APDUs to the right one, and
//! enforces device communication control.

use crate::apdu::{AbortPdu, Apdu};
use crate::appservice::client::ClientSsm;
use crate::appservice::server::ServerSsm;
use crate::appservice::ssm::{SsmCore, TimerChange};
use crate::comm::{ApduMessage, Layer, LayerCtx, Sdu};
use crate::device::CommunicationControl;
use crate::error::BacnetError;
use crate::pdu::{Address, Pdu};
use crate::task::TimerHandle;
use crate::types::{confirmed_service, unconfirmed_service, AbortReason};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::mem;
use log::{debug, error, trace, warn};

#[derive(Debug, Default)]
pub struct StateMachineAccessPoint {
    next_invoke_id: u8,
    next_transaction: u64,
    client_transactions: Vec<(u64, ClientSsm)>,
    server_transactions: Vec<(u64, ServerSsm)>,
    timers: BTreeMap<u64, TimerHandle>,
}

impl StateMachineAccessPoint {
    pub fn new() -> Self {
        StateMachineAccessPoint {
            next_invoke_id: 1,
            ..Self::default()
        }
    }

    pub fn client_transaction_count(&self) -> usize {
        self.client_transactions.len()
    }

    pub fn server_transaction_count(&self) -> usize {
        self.server_transactions.len()
    }

    /// Find an unused invoke ID for the destination. IDs already bound
    /// to a transaction with the same peer are skipped.
    fn get_next_invoke_id(&mut self, address: &Address) -> Result<u8, BacnetError> {
        let initial = self.next_invoke_id;
        loop {
            let invoke_id = self.next_invoke_id;
            self.next_invoke_id = self.next_invoke_id.wrapping_add(1);

            if initial == self.next_invoke_id {
                return Err(BacnetError::NoInvokeIdAvailable);
            }

            let in_use = self.client_transactions.iter().any(|(_, tr)| {
                tr.core.invoke_id == Some(invoke_id) && tr.core.peer == *address
            });
            if !in_use {
                return Ok(invoke_id);
            }
        }
    }

    fn next_transaction_id(&mut self) -> u64 {
        self.next_transaction += 1;
        self.next_transaction
    }

    fn find_client(&self, invoke_id: u8, peer: &Address) -> Option<usize> {
        self.client_transactions
            .iter()
            .position(|(_, tr)| tr.core.invoke_id == Some(invoke_id) && tr.core.peer == *peer)
    }

    fn find_server(&self, invoke_id: u8, peer: &Address) -> Option<usize> {
        self.server_transactions
            .iter()
            .position(|(_, tr)| tr.core.invoke_id == Some(invoke_id) && tr.core.peer == *peer)
    }

    /// Route the effects a transition recorded, then retire the machine
    /// if it reached a terminal state.
    fn apply_effects(
        &mut self,
        transaction: u64,
        core: &mut SsmCore,
        server: bool,
        ctx: &mut LayerCtx,
    ) {
        let effects = mem::take(&mut core.effects);

        for apdu in effects.to_peer {
            let mut pdu = Pdu::new();
            match apdu.encode(&mut pdu) {
                Ok(()) => {
                    pdu.destination = Some(core.peer.clone());
                    ctx.send_down(Sdu::Data(pdu));
                }
                Err(err) => error!("segment encoding failed: {}", err),
            }
        }
        for apdu in effects.to_app {
            let mut message = ApduMessage::from_source(core.peer.clone(), apdu);
            message.server_transaction = server;
            ctx.send_up(Sdu::Apdu(message));
        }
        match effects.timer {
            None => {}
            Some(TimerChange::Stop) => {
                if let Some(handle) = self.timers.remove(&transaction) {
                    ctx.cancel_timer(handle);
                }
            }
            Some(TimerChange::Restart(delay_ms)) => {
                if let Some(handle) = self.timers.remove(&transaction) {
                    ctx.cancel_timer(handle);
                }
                let handle = ctx.start_timer(transaction, delay_ms);
                self.timers.insert(transaction, handle);
            }
        }
    }

    fn finish_client(&mut self, transaction: u64, mut ssm: ClientSsm, ctx: &mut LayerCtx) {
        self.apply_effects(transaction, &mut ssm.core, false, ctx);
        if ssm.core.state.is_terminal() {
            trace!("client transaction {} retired", transaction);
            if let Some(handle) = self.timers.remove(&transaction) {
                ctx.cancel_timer(handle);
            }
            if let Some(record) = ssm.core.device_info {
                if let Err(err) = ctx.shared.device_info.release(record) {
                    error!("releasing peer record: {}", err);
                }
            }
        } else {
            self.client_transactions.push((transaction, ssm));
        }
    }

    fn finish_server(&mut self, transaction: u64, mut ssm: ServerSsm, ctx: &mut LayerCtx) {
        self.apply_effects(transaction, &mut ssm.core, true, ctx);
        if ssm.core.state.is_terminal() {
            trace!("server transaction {} retired", transaction);
            if let Some(handle) = self.timers.remove(&transaction) {
                ctx.cancel_timer(handle);
            }
            if let Some(record) = ssm.core.device_info {
                if let Err(err) = ctx.shared.device_info.release(record) {
                    error!("releasing peer record: {}", err);
                }
            }
        } else {
            self.server_transactions.push((transaction, ssm));
        }
    }

    /// Whether an incoming APDU passes device communication control.
    fn incoming_allowed(&self, dcc: CommunicationControl, apdu: &Apdu) -> bool {
        match dcc {
            CommunicationControl::Enable | CommunicationControl::DisableInitiation => true,
            CommunicationControl::Disable => match apdu {
                Apdu::ConfirmedRequest(request) => {
                    request.service == confirmed_service::DEVICE_COMMUNICATION_CONTROL
                        || request.service == confirmed_service::REINITIALIZE_DEVICE
                }
                Apdu::UnconfirmedRequest(request) => {
                    request.service == unconfirmed_service::WHO_IS
                }
                _ => false,
            },
        }
    }
}

impl Layer for StateMachineAccessPoint {
    /// A request or response from the service access point above.
    fn indication(&mut self, sdu: Sdu, ctx: &mut LayerCtx) -> Result<(), BacnetError> {
        let message = sdu.expect_apdu()?;
        let destination = message
            .destination
            .clone()
            .ok_or(BacnetError::Configuration("downstream APDU without destination"))?;
        let mut apdu = message.apdu;

        // Outbound initiations honour device communication control;
        // responses to a peer always pass.
        match &apdu {
            Apdu::ConfirmedRequest(_) | Apdu::UnconfirmedRequest(_) => match ctx.shared.dcc {
                CommunicationControl::Enable => {}
                CommunicationControl::Disable => {
                    debug!("communications disabled, request dropped");
                    return Ok(());
                }
                CommunicationControl::DisableInitiation => {
                    let is_i_am = matches!(
                        &apdu,
                        Apdu::UnconfirmedRequest(request)
                            if request.service == unconfirmed_service::I_AM
                    );
                    if !is_i_am {
                        debug!("initiation disabled, request dropped");
                        return Ok(());
                    }
                }
            },
            _ => {}
        }

        match apdu {
            Apdu::UnconfirmedRequest(_) => {
                let mut pdu = Pdu::new();
                apdu.encode(&mut pdu)?;
                pdu.destination = Some(destination);
                ctx.send_down(Sdu::Data(pdu));
                Ok(())
            }
            Apdu::ConfirmedRequest(ref mut request) => {
                match request.invoke_id {
                    None => {
                        request.invoke_id = match self.get_next_invoke_id(&destination) {
                            Ok(invoke_id) => Some(invoke_id),
                            Err(err) => {
                                error!("invoke ID allocation failed: {}", err);
                                ctx.send_up(Sdu::Apdu(ApduMessage::from_source(
                                    destination,
                                    Apdu::Abort(AbortPdu {
                                        server: false,
                                        invoke_id: 0,
                                        reason: AbortReason::OutOfResources,
                                    }),
                                )));
                                return Ok(());
                            }
                        };
                    }
                    Some(invoke_id) => {
                        // an ID supplied by the application must be free
                        if self.find_client(invoke_id, &destination).is_some() {
                            error!("invoke ID {} already in use for {}", invoke_id, destination);
                            ctx.send_up(Sdu::Apdu(ApduMessage::from_source(
                                destination,
                                Apdu::Abort(AbortPdu {
                                    server: false,
                                    invoke_id,
                                    reason: AbortReason::Other,
                                }),
                            )));
                            return Ok(());
                        }
                    }
                }

                if !destination.is_station() {
                    warn!("{} is not a local or remote station", destination);
                }

                let record = ctx.shared.device_info.acquire_address(&destination);
                let core = SsmCore::new(destination, &ctx.shared.config, record);
                let mut ssm = ClientSsm::new(core);
                let transaction = self.next_transaction_id();

                let result = ssm.indication(apdu, &ctx.shared.device_info);
                if let Err(err) = result {
                    error!("client transaction start failed: {}", err);
                }
                self.finish_client(transaction, ssm, ctx);
                Ok(())
            }
            Apdu::SimpleAck(_)
            | Apdu::ComplexAck(_)
            | Apdu::Error(_)
            | Apdu::Reject(_)
            | Apdu::Abort(_) => {
                // the application answering a server transaction
                let invoke_id = apdu.invoke_id().unwrap_or(0);
                match self.find_server(invoke_id, &destination) {
                    Some(index) => {
                        let (transaction, mut ssm) = self.server_transactions.swap_remove(index);
                        let result = ssm.confirmation(apdu, &ctx.shared.device_info);
                        if let Err(err) = result {
                            error!("server transaction response failed: {}", err);
                        }
                        self.finish_server(transaction, ssm, ctx);
                    }
                    None => debug!(
                        "no server transaction for response {} to {}",
                        invoke_id, destination
                    ),
                }
                Ok(())
            }
            Apdu::SegmentAck(_) => Err(BacnetError::InvalidState(
                "segment acks are generated by the transaction layer",
            )),
        }
    }

    /// An APDU arriving from the network layer below.
    fn confirmation(&mut self, sdu: Sdu, ctx: &mut LayerCtx) -> Result<(), BacnetError> {
        let mut pdu = sdu.expect_data()?;
        let source = pdu
            .source
            .clone()
            .ok_or(BacnetError::Decoding("inbound APDU without source"))?;

        let apdu = match Apdu::decode(&mut pdu) {
            Ok(apdu) => apdu,
            Err(err) => {
                // a malformed APDU cannot be answered, only dropped
                warn!("APDU decode failed: {}", err);
                return Ok(());
            }
        };
        trace!("apdu in from {}: {:?}", source, apdu.apdu_type());

        if !self.incoming_allowed(ctx.shared.dcc, &apdu) {
            debug!("communications disabled, inbound APDU dropped");
            return Ok(());
        }

        // Requests and responses route by type; an abort or segment ack
        // carries a flag naming which side of the transaction it is for.
        enum Route {
            Server,
            Client,
            Unconfirmed,
        }
        let invoke_id = apdu.invoke_id().unwrap_or(0);
        let route = match &apdu {
            Apdu::ConfirmedRequest(_) => Route::Server,
            Apdu::UnconfirmedRequest(_) => Route::Unconfirmed,
            Apdu::SimpleAck(_) | Apdu::ComplexAck(_) | Apdu::Error(_) | Apdu::Reject(_) => {
                Route::Client
            }
            Apdu::Abort(abort) => {
                if abort.server {
                    Route::Client
                } else {
                    Route::Server
                }
            }
            Apdu::SegmentAck(ack) => {
                if ack.server {
                    Route::Client
                } else {
                    Route::Server
                }
            }
        };

        match route {
            Route::Unconfirmed => {
                ctx.send_up(Sdu::Apdu(ApduMessage::from_source(source, apdu)));
            }
            Route::Client => match self.find_client(invoke_id, &source) {
                Some(index) => {
                    let (transaction, mut ssm) = self.client_transactions.swap_remove(index);
                    let result = ssm.confirmation(apdu);
                    if let Err(err) = result {
                        error!("client transaction failed: {}", err);
                    }
                    self.finish_client(transaction, ssm, ctx);
                }
                None => debug!("no client transaction for {} from {}", invoke_id, source),
            },
            Route::Server => {
                // only a confirmed request may start a new transaction;
                // a match on an existing one is a retransmission
                let is_request = matches!(apdu, Apdu::ConfirmedRequest(_));
                let index = match self.find_server(invoke_id, &source) {
                    Some(index) => Some(index),
                    None if is_request => {
                        let record = ctx.shared.device_info.acquire_address(&source);
                        let core = SsmCore::new(source.clone(), &ctx.shared.config, record);
                        let ssm = ServerSsm::new(core, ctx.shared.config.application_timeout_ms);
                        let transaction = self.next_transaction_id();
                        self.server_transactions.push((transaction, ssm));
                        Some(self.server_transactions.len() - 1)
                    }
                    None => None,
                };
                match index {
                    Some(index) => {
                        let (transaction, mut ssm) = self.server_transactions.swap_remove(index);
                        let result = ssm.indication(apdu, &mut ctx.shared.device_info);
                        if let Err(err) = result {
                            error!("server transaction failed: {}", err);
                        }
                        self.finish_server(transaction, ssm, ctx);
                    }
                    None => debug!("no server transaction for {} from {}", invoke_id, source),
                }
            }
        }
        Ok(())
    }

    fn timer_expired(&mut self, token: u64, ctx: &mut LayerCtx) {
        self.timers.remove(&token);

        if let Some(index) = self
            .client_transactions
            .iter()
            .position(|(transaction, _)| *transaction == token)
        {
            let (transaction, mut ssm) = self.client_transactions.swap_remove(index);
            let result = ssm.timeout(&ctx.shared.device_info);
            if let Err(err) = result {
                error!("client transaction timeout failed: {}", err);
            }
            self.finish_client(transaction, ssm, ctx);
            return;
        }

        if let Some(index) = self
            .server_transactions
            .iter()
            .position(|(transaction, _)| *transaction == token)
        {
            let (transaction, mut ssm) = self.server_transactions.swap_remove(index);
            let result = ssm.timeout();
            if let Err(err) = result {
                error!("server transaction timeout failed: {}", err);
            }
            self.finish_server(transaction, ssm, ctx);
            return;
        }

        trace!("timer for a retired transaction, ignored");
    }
}
