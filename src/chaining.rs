//! ISO/IEC 14443-4 half-duplex block transmission protocol.
//!
//! [`ChainingTransport`] turns the single frame exchange of a [`Link`] into a
//! reliable APDU exchange. Commands longer than the card's frame size are
//! split into chained I-blocks, chained responses are reassembled, and
//! waiting time extension requests are answered.

use crate::bytes2hex;
use crate::link::{frame_size_from_ats, CardSession, FrameOptions, Link, LinkError, SelectStatus, RATS};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// Upper bound for any frame timeout, including extended waiting time.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(15);

/// Protocol control byte and CRC_A taken from every frame.
const FRAME_OVERHEAD: usize = 3;

const PCB_I_BLOCK: u8 = 0x02;
const PCB_R_ACK: u8 = 0xA2;
const PCB_CHAINING: u8 = 0x10;
const PCB_CID_FOLLOWING: u8 = 0x08;
const PCB_NAD_FOLLOWING: u8 = 0x04;
const PCB_BLOCK_NUMBER: u8 = 0x01;

/// Configuration of a [`ChainingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainingConfig {
    /// Split commands longer than the frame size into chained I-blocks.
    pub input_chaining: bool,
    /// Time to wait for each frame.
    pub timeout: Duration,
    /// Largest frame the reader accepts, used while the FSC is unknown.
    pub device_frame_size: usize,
    /// Largest reassembled response accepted.
    pub max_response_len: usize,
    /// Number of consecutive S(WTX) requests honoured for one frame.
    pub max_wtx_rounds: u32,
}

impl Default for ChainingConfig {
    fn default() -> Self {
        Self {
            input_chaining: true,
            timeout: Duration::from_millis(1500),
            device_frame_size: 512,
            // Extended Le plus the status word
            max_response_len: 65_538,
            max_wtx_rounds: 200,
        }
    }
}

impl ChainingConfig {
    #[must_use]
    pub const fn with_input_chaining(mut self, input_chaining: bool) -> Self {
        self.input_chaining = input_chaining;
        self
    }

    /// Sets the frame timeout, clamped to [`MAX_TIMEOUT`].
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.min(MAX_TIMEOUT);
        self
    }

    #[must_use]
    pub const fn with_device_frame_size(mut self, device_frame_size: usize) -> Self {
        self.device_frame_size = device_frame_size;
        self
    }

    #[must_use]
    pub const fn with_max_response_len(mut self, max_response_len: usize) -> Self {
        self.max_response_len = max_response_len;
        self
    }

    #[must_use]
    pub const fn with_max_wtx_rounds(mut self, max_wtx_rounds: u32) -> Self {
        self.max_wtx_rounds = max_wtx_rounds;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChainingError {
    /// The reader timed out waiting for the card.
    ConnectionTimeout,
    /// The card answered with an empty frame.
    NoResponse,
    /// The reassembled response exceeds the configured maximum.
    BufferTooSmall { needed: usize, maximum: usize },
    /// The received block type or block number is not the expected one.
    FramingMismatch { expected: u8, found: u8 },
    CrcError,
    /// I-block/R-block acknowledgement out of order.
    SequenceError(&'static str),
    /// RATS failed on a card selected without ATS.
    NoAts,
    NoCardInField,
    /// The card does not support ISO 14443-4.
    UnsupportedMode,
    /// The response is shorter than a status word.
    ShortResponse(usize),
    /// The card kept requesting waiting time extensions.
    WtxLimit(u32),
}
impl fmt::Display for ChainingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::ConnectionTimeout => write!(f, "Reply timeout"),
            Self::NoResponse => write!(f, "No APDU response"),
            Self::BufferTooSmall { needed, maximum } => {
                write!(f, "Buffer too small ({maximum}), needs {needed} bytes")
            }
            Self::FramingMismatch { expected, found } => write!(
                f,
                "ISO 14443-4 framing error, card sent {found:02X} must be {expected:02X}"
            ),
            Self::CrcError => write!(f, "ISO 14443-A CRC error"),
            Self::SequenceError(reason) => {
                write!(f, "I-block/R-block sequence error: {reason}")
            }
            Self::NoAts => write!(f, "Can't get ATS"),
            Self::NoCardInField => write!(f, "No card in field"),
            Self::UnsupportedMode => write!(f, "Card is not in ISO 14443-4 mode"),
            Self::ShortResponse(len) => write!(f, "Small APDU response, len: {len}"),
            Self::WtxLimit(rounds) => {
                write!(f, "Card requested {rounds} waiting time extensions in a row")
            }
        }
    }
}
impl std::error::Error for ChainingError {}

impl From<LinkError> for ChainingError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Timeout => Self::ConnectionTimeout,
            LinkError::NoCardInField => Self::NoCardInField,
            LinkError::UnsupportedMode => Self::UnsupportedMode,
            LinkError::Crc => Self::CrcError,
        }
    }
}

/// Where a logical exchange currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Selecting,
    /// Block `chunk` is handed to the link.
    Sending { chunk: usize },
    /// The card asked for more time to answer block `chunk`.
    AwaitingResponse { chunk: usize },
    ReceivingChained,
    Complete,
    Failed(ChainingError),
}

/// State of one logical APDU exchange.
///
/// Created per call of [`ChainingTransport::exchange_apdu`], every physical
/// frame of the call carries the same block number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainingExchange {
    block_toggle: bool,
    pending_output: Vec<u8>,
    state: ExchangeState,
    trail: Vec<ExchangeState>,
}

impl ChainingExchange {
    const fn new(block_toggle: bool) -> Self {
        Self {
            block_toggle,
            pending_output: Vec::new(),
            state: ExchangeState::Idle,
            trail: Vec::new(),
        }
    }

    #[must_use]
    pub const fn block_toggle(&self) -> bool {
        self.block_toggle
    }

    #[must_use]
    pub const fn state(&self) -> &ExchangeState {
        &self.state
    }

    /// Response bytes gathered so far. Handed over to the caller on
    /// completion, so empty once the exchange is `Complete`.
    #[must_use]
    pub fn pending_output(&self) -> &[u8] {
        &self.pending_output
    }

    /// States left so far, oldest first.
    #[must_use]
    pub fn trail(&self) -> &[ExchangeState] {
        &self.trail
    }

    fn transition(&mut self, state: ExchangeState) {
        trace!("Exchange state {:?} -> {state:?}", self.state);
        let previous = std::mem::replace(&mut self.state, state);
        self.trail.push(previous);
    }

    const fn block_bit(&self) -> u8 {
        if self.block_toggle {
            PCB_BLOCK_NUMBER
        } else {
            0
        }
    }
}

/// APDU exchange over an ISO 14443-4 link.
pub struct ChainingTransport<L: Link> {
    link: L,
    config: ChainingConfig,
    /// Block number for the next logical call.
    next_block: bool,
    /// Negotiated FSC, 0 when unknown.
    frame_size: u16,
    field_on: bool,
    card: Option<CardSession>,
    last_exchange: Option<ChainingExchange>,
}

impl<L: Link> ChainingTransport<L> {
    #[must_use]
    pub const fn new(link: L, config: ChainingConfig) -> Self {
        Self {
            link,
            config,
            next_block: false,
            frame_size: 0,
            field_on: false,
            card: None,
            last_exchange: None,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ChainingConfig {
        &self.config
    }

    /// Negotiated FSC, `0` when unknown.
    #[must_use]
    pub const fn frame_size(&self) -> u16 {
        self.frame_size
    }

    /// The card selected since the field was last switched on.
    #[must_use]
    pub const fn card(&self) -> Option<&CardSession> {
        self.card.as_ref()
    }

    #[must_use]
    pub const fn is_field_on(&self) -> bool {
        self.field_on
    }

    /// The most recent logical exchange, in its terminal state.
    #[must_use]
    pub const fn last_exchange(&self) -> Option<&ChainingExchange> {
        self.last_exchange.as_ref()
    }

    #[must_use]
    pub const fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    #[must_use]
    pub fn into_link(self) -> L {
        self.link
    }

    /// Switches the RF field off. The selected card is forgotten.
    pub fn drop_field(&mut self) {
        trace!("Dropping field");
        self.link.drop_field();
        self.field_on = false;
        self.card = None;
    }

    /// Selects a card and learns its frame size.
    ///
    /// The field is switched off first. Cards selected without ATS are sent
    /// RATS. With `disconnect` the field is switched off again afterwards.
    ///
    /// # Returns
    ///
    /// The selected card, with `frame_size` set when the ATS announces one.
    ///
    /// # Errors
    ///
    /// * `ChainingError::NoCardInField` if anticollision found nothing.
    /// * `ChainingError::UnsupportedMode` for cards without ISO 14443-4.
    /// * `ChainingError::NoAts` if RATS fails.
    pub fn select_14443_4(&mut self, disconnect: bool) -> Result<CardSession, ChainingError> {
        self.frame_size = 0;
        self.drop_field();

        let mut card = self.link.select_card(false).map_err(|err| {
            error!("Anticollision failed: {err}");
            ChainingError::from(err)
        })?;
        self.field_on = true;
        self.next_block = false;

        match card.select_status {
            SelectStatus::WithAts => {}
            SelectStatus::WithoutAts => {
                let options = FrameOptions::new(self.config.timeout);
                let ats = match self.link.exchange_raw_frame(&RATS, &options) {
                    Ok(ats) if !ats.is_empty() => ats,
                    Ok(_) => {
                        error!("Can't get ATS, card sent an empty answer to RATS");
                        return Err(ChainingError::NoAts);
                    }
                    Err(err) => {
                        error!("Can't get ATS: {err}");
                        return Err(ChainingError::NoAts);
                    }
                };
                trace!("ATS: {}", bytes2hex(&ats));
                card.ats = ats;
            }
            SelectStatus::Proprietary => {
                error!("Card not in ISO 14443-4, proprietary anticollision");
                return Err(ChainingError::UnsupportedMode);
            }
        }

        card.frame_size = frame_size_from_ats(&card.ats).unwrap_or(0);
        self.frame_size = card.frame_size;
        info!(
            "Selected card UID: {}, frame size: {}",
            bytes2hex(&card.uid),
            self.frame_size
        );
        self.card = Some(card.clone());

        if disconnect {
            self.drop_field();
        }
        Ok(card)
    }

    /// Exchanges one APDU with the card.
    ///
    /// # Arguments
    ///
    /// * `apdu` - Serialized command APDU.
    /// * `activate_field` - Select the card before sending.
    /// * `leave_signal_on` - Keep the field on afterwards, also on failure.
    ///
    /// # Returns
    ///
    /// The reassembled response APDU, status word included.
    ///
    /// # Errors
    ///
    /// * `ChainingError` on any link, framing or sequencing failure. Nothing
    ///   is retried.
    pub fn exchange_apdu(
        &mut self,
        apdu: &[u8],
        activate_field: bool,
        leave_signal_on: bool,
    ) -> Result<Vec<u8>, ChainingError> {
        let mut exchange = ChainingExchange::new(self.next_block);
        let result = self.run_exchange(&mut exchange, apdu, activate_field);
        match result {
            Ok(_) => exchange.transition(ExchangeState::Complete),
            Err(ref err) => exchange.transition(ExchangeState::Failed(err.clone())),
        }
        self.last_exchange = Some(exchange);

        if !leave_signal_on {
            self.drop_field();
        }
        result
    }

    fn run_exchange(
        &mut self,
        exchange: &mut ChainingExchange,
        apdu: &[u8],
        activate_field: bool,
    ) -> Result<Vec<u8>, ChainingError> {
        if activate_field {
            exchange.transition(ExchangeState::Selecting);
            self.select_14443_4(false)?;
        }
        exchange.block_toggle = self.next_block;
        self.next_block = !self.next_block;

        let capacity = if self.frame_size > 0 {
            usize::from(self.frame_size) - FRAME_OVERHEAD
        } else {
            self.config.device_frame_size.saturating_sub(FRAME_OVERHEAD).max(1)
        };
        let chunks: Vec<&[u8]> = if self.config.input_chaining && apdu.len() > capacity {
            apdu.chunks(capacity).collect()
        } else {
            vec![apdu]
        };
        trace!(
            "Sending APDU: {} in {} block(s)",
            bytes2hex(apdu),
            chunks.len()
        );

        let block_bit = exchange.block_bit();
        let mut response = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let last = i + 1 == chunks.len();
            let mut pcb = PCB_I_BLOCK | block_bit;
            if !last {
                pcb |= PCB_CHAINING;
            }
            let mut frame = Vec::with_capacity(1 + chunk.len());
            frame.push(pcb);
            frame.extend_from_slice(chunk);

            exchange.transition(ExchangeState::Sending { chunk: i });
            let answer = self.transceive(&frame, true, Some(&mut *exchange))?;
            let is_ack = answer[0] & 0xF2 == PCB_R_ACK;

            if !last {
                if !is_ack {
                    error!(
                        "I-block/R-block sequence error. Data len={}, sent block {}, card answered {}",
                        apdu.len(),
                        i,
                        bytes2hex(&answer)
                    );
                    return Err(ChainingError::SequenceError(
                        "card answered a chained block with data",
                    ));
                }
                trace!("Block {i} acknowledged");
            } else if is_ack {
                error!("I-block/R-block sequence error, card acknowledged the last block");
                return Err(ChainingError::SequenceError(
                    "card acknowledged the last block",
                ));
            } else {
                response = answer;
            }
        }

        loop {
            let pcb = response[0];
            if pcb & 0xE2 != PCB_I_BLOCK || pcb & PCB_BLOCK_NUMBER != block_bit {
                error!("ISO 14443-4 framing error, card sent {pcb:02X}");
                return Err(ChainingError::FramingMismatch {
                    expected: PCB_I_BLOCK | block_bit,
                    found: pcb,
                });
            }
            let mut inf_start = 1;
            if pcb & PCB_CID_FOLLOWING != 0 {
                inf_start += 1;
            }
            if pcb & PCB_NAD_FOLLOWING != 0 {
                inf_start += 1;
            }
            let inf = response.get(inf_start..).unwrap_or_default();

            let needed = exchange.pending_output.len() + inf.len();
            if needed > self.config.max_response_len {
                error!(
                    "APDU: Buffer too small({}). Needs {needed} bytes",
                    self.config.max_response_len
                );
                return Err(ChainingError::BufferTooSmall {
                    needed,
                    maximum: self.config.max_response_len,
                });
            }
            exchange.pending_output.extend_from_slice(inf);

            if pcb & PCB_CHAINING == 0 {
                break;
            }
            exchange.transition(ExchangeState::ReceivingChained);
            response = self.transceive(&[PCB_R_ACK | block_bit], true, Some(&mut *exchange))?;
        }

        if exchange.pending_output.len() < 2 {
            error!(
                "APDU: Small APDU response. Len={}",
                exchange.pending_output.len()
            );
            return Err(ChainingError::ShortResponse(exchange.pending_output.len()));
        }

        let output = std::mem::take(&mut exchange.pending_output);
        trace!("APDU response: {}", bytes2hex(&output));
        Ok(output)
    }

    /// Exchanges one I-block carrying a CID, without chaining.
    ///
    /// The frame is `0A|block, 00, data..`; the card must echo the same
    /// protocol control byte. Without `leave_signal_on` the reader is told to
    /// switch the field off along with the frame.
    ///
    /// # Returns
    ///
    /// The information field following the echoed PCB and CID.
    ///
    /// # Errors
    ///
    /// * `ChainingError` on link failures or a PCB mismatch.
    pub fn exchange_raw_apdu(
        &mut self,
        data: &[u8],
        activate_field: bool,
        leave_signal_on: bool,
    ) -> Result<Vec<u8>, ChainingError> {
        let result = self.run_raw_exchange(data, activate_field, leave_signal_on);
        if !leave_signal_on {
            self.drop_field();
        }
        result
    }

    fn run_raw_exchange(
        &mut self,
        data: &[u8],
        activate_field: bool,
        keep_field_on: bool,
    ) -> Result<Vec<u8>, ChainingError> {
        if activate_field {
            self.select_14443_4(false)?;
        }

        let pcb = PCB_I_BLOCK | PCB_CID_FOLLOWING | u8::from(self.next_block);
        self.next_block = !self.next_block;

        let mut frame = Vec::with_capacity(2 + data.len());
        frame.extend_from_slice(&[pcb, 0x00]);
        frame.extend_from_slice(data);

        let response = self.transceive(&frame, keep_field_on, None)?;
        if response[0] != pcb {
            error!(
                "ISO 14443-4 framing error. Card sent {:02X} must be {pcb:02X}",
                response[0]
            );
            return Err(ChainingError::FramingMismatch {
                expected: pcb,
                found: response[0],
            });
        }

        let payload = response.get(2..).unwrap_or_default().to_vec();
        if payload.len() > self.config.max_response_len {
            error!(
                "Buffer too small({}). Needs {} bytes",
                self.config.max_response_len,
                payload.len()
            );
            return Err(ChainingError::BufferTooSmall {
                needed: payload.len(),
                maximum: self.config.max_response_len,
            });
        }
        Ok(payload)
    }

    /// Sends a frame and returns the first answer that is not a waiting
    /// time extension request. The returned frame is never empty.
    fn transceive(
        &mut self,
        frame: &[u8],
        keep_field_on: bool,
        mut exchange: Option<&mut ChainingExchange>,
    ) -> Result<Vec<u8>, ChainingError> {
        let mut options =
            FrameOptions::new(self.config.timeout).with_keep_field_on(keep_field_on);
        let mut outgoing = frame.to_vec();
        let mut wtx_rounds = 0;

        loop {
            trace!("Sending frame: {}", bytes2hex(&outgoing));
            let response = self
                .link
                .exchange_raw_frame(&outgoing, &options)
                .map_err(|err| {
                    error!("Frame exchange failed: {err}");
                    ChainingError::from(err)
                })?;
            trace!("Received frame: {}", bytes2hex(&response));

            let Some(&pcb) = response.first() else {
                error!("No card response");
                return Err(ChainingError::NoResponse);
            };

            if pcb & 0xF7 != 0xF2 {
                return Ok(response);
            }

            // S(WTX)
            wtx_rounds += 1;
            if wtx_rounds > self.config.max_wtx_rounds {
                error!("Card requested more than {} waiting time extensions", self.config.max_wtx_rounds);
                return Err(ChainingError::WtxLimit(wtx_rounds));
            }
            let inf_start = if pcb & PCB_CID_FOLLOWING != 0 { 2 } else { 1 };
            let Some(&wtx_inf) = response.get(inf_start) else {
                error!("S(WTX) request without WTXM: {}", bytes2hex(&response));
                return Err(ChainingError::FramingMismatch {
                    expected: pcb,
                    found: pcb,
                });
            };
            let wtxm = u32::from(wtx_inf & 0x3F).max(1);
            debug!("Card requested waiting time extension, WTXM: {wtxm}");
            if let Some(exchange) = exchange.as_deref_mut() {
                if let ExchangeState::Sending { chunk } = exchange.state {
                    exchange.transition(ExchangeState::AwaitingResponse { chunk });
                }
            }

            options.timeout = self.config.timeout.saturating_mul(wtxm).min(MAX_TIMEOUT);
            outgoing = response[..=inf_start].to_vec();
        }
    }
}
