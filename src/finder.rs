//! Enumerating the command space of a card.
//!
//! [`find_apdus`] walks CLA, INS, P1 and P2 over a [`ChainingTransport`] and
//! records which commands the card answers with something other than
//! "instruction not supported".

use crate::apdu::ResponseApdu;
use crate::chaining::ChainingTransport;
use crate::link::Link;
use crate::{bytes2hex, Error};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// SELECT sent before the enumeration to check that the card speaks APDUs.
pub const TEST_SELECT: [u8; 16] = [
    0x00, 0xA4, 0x04, 0x00, 0x0A, 0xA0, 0x00, 0x00, 0x04, 0x40, 0x00, 0x01, 0x01, 0x00, 0x01,
    0x00,
];

const SW_SUCCESS: u16 = 0x9000;
const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;

/// Start values and limits of an APDU search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinderConfig {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    /// Minimum time between two re-selections of the card.
    pub reset_interval: Duration,
    /// How often a status word other than `90 00` is reported.
    pub error_limit: u64,
    /// Instructions that are never sent.
    pub skip_ins: Vec<u8>,
    /// Also send every command with `Le = 00`.
    pub with_le: bool,
    /// Consecutive failed exchanges tolerated for one command.
    pub max_retries: u32,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            cla: 0x00,
            ins: 0x00,
            p1: 0x00,
            p2: 0x00,
            reset_interval: Duration::from_secs(5 * 60),
            error_limit: 512,
            skip_ins: Vec::new(),
            with_le: false,
            max_retries: 3,
        }
    }
}

impl FinderConfig {
    /// Sets the start values of CLA, INS, P1 and P2.
    #[must_use]
    pub const fn with_start(mut self, cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        self.cla = cla;
        self.ins = ins;
        self.p1 = p1;
        self.p2 = p2;
        self
    }

    #[must_use]
    pub const fn with_reset_interval(mut self, reset_interval: Duration) -> Self {
        self.reset_interval = reset_interval;
        self
    }

    #[must_use]
    pub const fn with_error_limit(mut self, error_limit: u64) -> Self {
        self.error_limit = error_limit;
        self
    }

    #[must_use]
    pub fn with_skip_ins(mut self, skip_ins: &[u8]) -> Self {
        self.skip_ins = skip_ins.to_vec();
        self
    }

    #[must_use]
    pub const fn with_le(mut self, with_le: bool) -> Self {
        self.with_le = with_le;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A command and the answer that was reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundApdu {
    pub command: Vec<u8>,
    pub response: ResponseApdu,
}

/// Result of [`find_apdus`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinderReport {
    /// Every status word received and how often.
    pub status_words: BTreeMap<u16, u64>,
    /// Answers within the error limit, `6D 00` excluded.
    pub found: Vec<FoundApdu>,
    /// Commands answered by the card.
    pub commands_sent: u64,
    /// The search was stopped through the abort flag.
    pub aborted: bool,
    pub runtime: Duration,
}

impl FinderReport {
    /// Counts `sw` and tells whether the answer is worth reporting.
    fn record(&mut self, sw: u16, error_limit: u64) -> bool {
        let count = self.status_words.entry(sw).or_insert(0);
        *count += 1;
        match sw {
            SW_SUCCESS => true,
            SW_INS_NOT_SUPPORTED => false,
            _ => *count < error_limit,
        }
    }
}

struct Finder<'a, L: Link> {
    transport: &'a mut ChainingTransport<L>,
    config: &'a FinderConfig,
    abort: &'a AtomicBool,
    report: FinderReport,
    activate_field: bool,
}

impl<L: Link> Finder<'_, L> {
    fn aborted(&mut self) -> bool {
        if self.abort.load(Ordering::Relaxed) {
            info!("User interrupt detected. Aborting");
            self.report.aborted = true;
        }
        self.report.aborted
    }

    /// Sends `CLA INS P1 P2` and, if configured, `CLA INS P1 P2 00`.
    ///
    /// A failed exchange re-selects the card and starts over with the same
    /// instruction.
    fn probe(&mut self, header: [u8; 4]) -> Result<(), Error> {
        let mut failures = 0;
        'retry: loop {
            if self.aborted() {
                return Ok(());
            }
            let cases = if self.config.with_le { 2 } else { 1 };
            for case in 0..cases {
                let mut command = header.to_vec();
                if case == 1 {
                    command.push(0x00);
                }

                let response = self
                    .transport
                    .exchange_apdu(&command, self.activate_field, true)
                    .map_err(Error::from)
                    .and_then(|bytes| Ok(ResponseApdu::decode(&bytes)?));
                let response = match response {
                    Ok(response) => response,
                    Err(err) => {
                        self.transport.drop_field();
                        self.activate_field = true;
                        failures += 1;
                        if failures > self.config.max_retries {
                            error!("APDU {} failed {failures} times: {err}", bytes2hex(&command));
                            return Err(err);
                        }
                        warn!("APDU {} failed, re-selecting the card: {err}", bytes2hex(&command));
                        continue 'retry;
                    }
                };
                self.activate_field = false;
                self.report.commands_sent += 1;

                let sw = response.sw();
                if self.report.record(sw, self.config.error_limit) {
                    info!(
                        "Got response for APDU \"{}\": {sw:04X}",
                        bytes2hex(&command)
                    );
                    if !response.data.is_empty() {
                        info!("Response data is: {}", bytes2hex(&response.data));
                    }
                    self.report.found.push(FoundApdu { command, response });
                }
            }
            return Ok(());
        }
    }

    fn run(&mut self) -> Result<(), Error> {
        let start = (self.config.cla, self.config.ins, self.config.p1, self.config.p2);
        let (mut cla, mut p1, mut p2) = (start.0, start.2, start.3);
        let mut inc_p1 = true;
        let mut last_reset = Instant::now();

        loop {
            loop {
                let mut ins = start.1;
                loop {
                    if self.aborted() {
                        return Ok(());
                    }
                    if !self.config.skip_ins.contains(&ins) {
                        self.probe([cla, ins, p1, p2])?;
                    }
                    ins = ins.wrapping_add(1);
                    if ins == start.1 {
                        break;
                    }
                }

                // P1 and P2 are incremented in turns
                if inc_p1 {
                    p1 = p1.wrapping_add(1);
                } else {
                    p2 = p2.wrapping_add(1);
                }
                inc_p1 = !inc_p1;

                let since_reset = last_reset.elapsed();
                if since_reset >= self.config.reset_interval {
                    info!(
                        "Last reset was {} seconds ago. Resetting the card to prevent timeout issues",
                        since_reset.as_secs()
                    );
                    self.transport.drop_field();
                    self.activate_field = true;
                    last_reset = Instant::now();
                }
                debug!("Status: [ CLA {cla:02X} P1 {p1:02X} P2 {p2:02X} ]");

                if p1 == start.2 && p2 == start.3 {
                    break;
                }
            }
            cla = cla.wrapping_add(1);
            info!("Status: [ CLA {cla:02X} P1 {p1:02X} P2 {p2:02X} ]");
            if cla == start.0 {
                return Ok(());
            }
        }
    }
}

/// Enumerates APDUs to find the commands a card supports.
///
/// A test SELECT is sent first. Then every INS is tried for each P1/P2
/// pair, P1 and P2 being incremented in turns, for every CLA, starting at
/// and wrapping back to the configured values. The card is re-selected
/// after a failed exchange and whenever `reset_interval` has passed.
///
/// `abort` is checked before every command, the field is switched off when
/// the search ends.
///
/// # Errors
///
/// * `Error::Chaining` if the card does not answer the test SELECT.
/// * `Error` if one command keeps failing after `max_retries` re-selections.
pub fn find_apdus<L: Link>(
    transport: &mut ChainingTransport<L>,
    config: &FinderConfig,
    abort: &AtomicBool,
) -> Result<FinderReport, Error> {
    let started = Instant::now();

    info!("Sending a test APDU (select file command) to check if the card is responding to APDUs");
    if let Err(err) = transport.exchange_apdu(&TEST_SELECT, true, false) {
        error!("Card did not respond to a test APDU (select file command): {err}. Aborting");
        return Err(err.into());
    }
    info!(
        "Got response. Starting the APDU finder [ CLA {:02X} INS {:02X} P1 {:02X} P2 {:02X} ]",
        config.cla, config.ins, config.p1, config.p2
    );

    let mut finder = Finder {
        transport,
        config,
        abort,
        report: FinderReport::default(),
        activate_field: true,
    };
    let result = finder.run();
    finder.transport.drop_field();

    let mut report = finder.report;
    report.runtime = started.elapsed();
    info!("Runtime: {} seconds", report.runtime.as_secs());
    result.map(|()| report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaining::{ChainingConfig, ChainingError};
    use crate::link::{CardSession, FrameOptions, LinkError, SelectStatus};
    use hex_literal::hex;
    use std::sync::Arc;

    /// Card answering by instruction that raises the abort flag after a
    /// number of frames.
    struct ProbedCard {
        abort: Arc<AtomicBool>,
        abort_after: usize,
        fail_frames: Vec<usize>,
        sent: Vec<Vec<u8>>,
        selects: usize,
        drops: usize,
    }

    impl ProbedCard {
        fn new(abort: &Arc<AtomicBool>, abort_after: usize) -> Self {
            Self {
                abort: Arc::clone(abort),
                abort_after,
                fail_frames: Vec::new(),
                sent: Vec::new(),
                selects: 0,
                drops: 0,
            }
        }

        /// APDUs sent after the test SELECT, without the PCB.
        fn commands(&self) -> Vec<Vec<u8>> {
            self.sent.iter().skip(1).map(|frame| frame[1..].to_vec()).collect()
        }
    }

    impl Link for ProbedCard {
        fn exchange_raw_frame(
            &mut self,
            frame: &[u8],
            _options: &FrameOptions,
        ) -> Result<Vec<u8>, LinkError> {
            self.sent.push(frame.to_vec());
            if self.sent.len() >= self.abort_after {
                self.abort.store(true, Ordering::Relaxed);
            }
            if self.fail_frames.contains(&self.sent.len()) {
                return Err(LinkError::Timeout);
            }

            let mut response = vec![frame[0]];
            match frame[2] {
                0xB0 => response.extend_from_slice(&hex!("CAFE 9000")),
                0xCA => response.extend_from_slice(&hex!("6A82")),
                _ => response.extend_from_slice(&hex!("6D00")),
            }
            Ok(response)
        }

        fn select_card(&mut self, _skip_rats: bool) -> Result<CardSession, LinkError> {
            self.selects += 1;
            Ok(CardSession {
                uid: hex!("04A1B2C3").to_vec(),
                atqa: hex!("0400"),
                sak: 0x20,
                ats: hex!("0578807002").to_vec(),
                select_status: SelectStatus::WithAts,
                frame_size: 0,
            })
        }

        fn drop_field(&mut self) {
            self.drops += 1;
        }
    }

    fn transport(card: ProbedCard) -> ChainingTransport<ProbedCard> {
        ChainingTransport::new(card, ChainingConfig::default())
    }

    #[test]
    fn test_report_rules() {
        let mut report = FinderReport::default();
        assert!(report.record(0x9000, 1));
        assert!(report.record(0x9000, 1));
        assert!(!report.record(0x6D00, 512));
        assert!(report.record(0x6A82, 3));
        assert!(report.record(0x6A82, 3));
        assert!(!report.record(0x6A82, 3));
        assert_eq!(report.status_words.get(&0x6A82), Some(&3));
        assert_eq!(report.status_words.get(&0x9000), Some(&2));
    }

    #[test]
    fn test_unresponsive_card_aborts() {
        let abort = Arc::new(AtomicBool::new(false));
        let mut card = ProbedCard::new(&abort, usize::MAX);
        card.fail_frames = vec![1];
        let mut transport = transport(card);

        let result = find_apdus(&mut transport, &FinderConfig::default(), &abort);
        assert!(matches!(
            result,
            Err(Error::Chaining(ChainingError::ConnectionTimeout))
        ));
        assert_eq!(transport.link().sent.len(), 1);
        assert_eq!(transport.link().sent[0][1..], TEST_SELECT);
    }

    #[test]
    fn test_instruction_loop_skips_and_stops_on_abort() -> Result<(), Error> {
        let abort = Arc::new(AtomicBool::new(false));
        let mut transport = transport(ProbedCard::new(&abort, 4));
        let config = FinderConfig::default()
            .with_start(0x00, 0xB0, 0x00, 0x00)
            .with_skip_ins(&[0xB1]);

        let report = find_apdus(&mut transport, &config, &abort)?;
        assert!(report.aborted);
        assert_eq!(report.commands_sent, 3);
        assert_eq!(
            transport.link().commands(),
            vec![
                hex!("00B00000").to_vec(),
                hex!("00B20000").to_vec(),
                hex!("00B30000").to_vec()
            ]
        );
        assert_eq!(report.status_words.get(&0x9000), Some(&1));
        assert_eq!(report.status_words.get(&0x6D00), Some(&2));
        assert_eq!(
            report.found,
            vec![FoundApdu {
                command: hex!("00B00000").to_vec(),
                response: ResponseApdu {
                    data: hex!("CAFE").to_vec(),
                    sw1: 0x90,
                    sw2: 0x00,
                },
            }]
        );
        assert!(!transport.is_field_on());
        Ok(())
    }

    #[test]
    fn test_with_le_and_error_limit() -> Result<(), Error> {
        let abort = Arc::new(AtomicBool::new(false));
        let mut transport = transport(ProbedCard::new(&abort, 3));
        let config = FinderConfig::default()
            .with_start(0x00, 0xCA, 0x00, 0x00)
            .with_le(true)
            .with_error_limit(2);

        let report = find_apdus(&mut transport, &config, &abort)?;
        assert_eq!(
            transport.link().commands(),
            vec![hex!("00CA0000").to_vec(), hex!("00CA000000").to_vec()]
        );
        // Block number restarts after the field was dropped
        assert_eq!(transport.link().sent[1][0], 0x02);
        assert_eq!(transport.link().sent[2][0], 0x03);
        assert_eq!(report.status_words.get(&0x6A82), Some(&2));
        assert_eq!(report.found.len(), 1);
        assert_eq!(report.found[0].command, hex!("00CA0000"));
        Ok(())
    }

    #[test]
    fn test_p1_p2_alternate_and_card_is_reset() -> Result<(), Error> {
        let abort = Arc::new(AtomicBool::new(false));
        let mut transport = transport(ProbedCard::new(&abort, 4));
        let skip: Vec<u8> = (0x01..=0xFF).collect();
        let config = FinderConfig::default()
            .with_skip_ins(&skip)
            .with_reset_interval(Duration::ZERO);

        find_apdus(&mut transport, &config, &abort)?;
        assert_eq!(
            transport.link().commands(),
            vec![
                hex!("00000000").to_vec(),
                hex!("00000100").to_vec(),
                hex!("00000101").to_vec()
            ]
        );
        // Test SELECT, the first command and one per P1/P2 step
        assert_eq!(transport.link().selects, 4);
        Ok(())
    }

    #[test]
    fn test_failed_exchange_is_retried() -> Result<(), Error> {
        let abort = Arc::new(AtomicBool::new(false));
        let mut card = ProbedCard::new(&abort, 4);
        card.fail_frames = vec![3];
        let mut transport = transport(card);
        let config = FinderConfig::default().with_start(0x00, 0xB0, 0x00, 0x00);

        let report = find_apdus(&mut transport, &config, &abort)?;
        assert_eq!(
            transport.link().commands(),
            vec![
                hex!("00B00000").to_vec(),
                hex!("00B10000").to_vec(),
                hex!("00B10000").to_vec()
            ]
        );
        assert_eq!(report.commands_sent, 2);
        assert_eq!(transport.link().selects, 3);
        Ok(())
    }

    #[test]
    fn test_retry_limit() {
        let abort = Arc::new(AtomicBool::new(false));
        let mut card = ProbedCard::new(&abort, usize::MAX);
        card.fail_frames = vec![2, 3];
        let mut transport = transport(card);
        let config = FinderConfig::default().with_max_retries(1);

        let result = find_apdus(&mut transport, &config, &abort);
        assert!(matches!(
            result,
            Err(Error::Chaining(ChainingError::ConnectionTimeout))
        ));
        assert!(!transport.is_field_on());
        assert!(transport.link().drops >= 2);
    }
}
