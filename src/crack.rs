// CBC/PKCS#7 padding oracle attack.
//
// CBC decryption computes each plaintext block as
//
//                 P_i = D(C_i) ⊕ C_{i-1}.
//
// The attacker controls C_{i-1}. Replacing it with a modified block X gives
// the oracle the plaintext P'_i = D(C_i) ⊕ X, and since
// D(C_i) = P_i ⊕ C_{i-1},
//
//                 P'_i = P_i ⊕ C_{i-1} ⊕ X.
//
// To learn byte `pos` of P_i we want P'_i to end in a padding of length
// L = B - pos. For every byte `k > pos` we already know P_i[k], so we set
//
//                 X[k] = C_{i-1}[k] ⊕ P_i[k] ⊕ L
//
// which makes P'_i[k] = L. For byte `pos` itself we guess g and set
// X[pos] = C_{i-1}[pos] ⊕ g ⊕ L. The padding is valid exactly when
// P'_i[pos] = L, i.e. when g = P_i[pos]. The oracle only has to tell us
// whether the padding was valid.
//
// Two things can spoil this:
//
// * An accidental accept. With L = 1, the last byte may become some M > 1
//   while the M - 1 bytes before it happen to already decrypt to M. Flipping
//   a bit of X[pos - 1] destroys such a padding but leaves a genuine one
//   alone, so every accept with `pos > 0` is confirmed by a second query.
// * The genuine padding of the real message. In the last block, g = L leaves
//   X[pos] untouched, so the real padding can make the oracle accept. That
//   guess is skipped in the last block and, if nothing else is accepted, the
//   byte must be L.
//
// Blocks are cracked from the last to the first data block. The IV is never
// a target, as nothing precedes it.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{debug, info, trace, warn};
use rayon::prelude::*;
use zeroize::Zeroizing;

use crate::{pkcs7_unpad, CrackError, PaddingOracle};

const DEFAULT_PROGRESS_INTERVAL: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrackResult {
    pub plaintext: Vec<u8>,
    pub oracle_calls: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrackOptions {
    /// Fail with [`CrackError::OracleInconsistency`] instead of logging a
    /// warning when a byte outside the last block cannot be recovered.
    pub strict: bool,
    /// Number of oracle calls between two progress reports.
    pub progress_interval: usize,
}

impl Default for CrackOptions {
    fn default() -> Self {
        Self {
            strict: false,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl CrackOptions {
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_progress_interval(mut self, interval: usize) -> Self {
        self.progress_interval = interval.max(1);
        self
    }
}

type ProgressFn<'a> = Box<dyn Fn(usize) + Send + Sync + 'a>;

/// Recovers plaintext from CBC ciphertexts through a padding oracle.
pub struct Cracker<'a, O: ?Sized> {
    oracle: &'a O,
    options: CrackOptions,
    progress: Option<ProgressFn<'a>>,
    cancel: Option<&'a AtomicBool>,
}

impl<'a, O: PaddingOracle + ?Sized> Cracker<'a, O> {
    pub fn new(oracle: &'a O) -> Self {
        Self {
            oracle,
            options: CrackOptions::default(),
            progress: None,
            cancel: None,
        }
    }

    pub fn with_options(mut self, options: CrackOptions) -> Self {
        self.options = options;
        self
    }

    /// Report the cumulative number of oracle calls every
    /// `progress_interval` calls, and once more when the crack finishes.
    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'a,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Abort with [`CrackError::Cancelled`] once `flag` is set. The flag is
    /// checked before every guess.
    pub fn with_cancellation(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Crack `ciphertext` (IV || encrypted blocks) one block at a time.
    pub fn crack(&self, ciphertext: &[u8], block_size: usize) -> Result<CrackResult, CrackError> {
        let n_blocks = validate_input(ciphertext, block_size)?;
        info!("cracking {} blocks of {block_size} bytes", n_blocks - 1);

        let run = CrackRun::new(self, block_size);
        let mut working = WorkingCiphertext::new(ciphertext);
        let mut recovered = Zeroizing::new(vec![0u8; ciphertext.len() - block_size]);
        for block_idx in (1..n_blocks).rev() {
            let start = block_idx * block_size;
            let is_last_block = block_idx == n_blocks - 1;
            let mut window = working.window(ciphertext, start, block_size);
            run.crack_block(
                &mut window,
                &mut recovered[(start - block_size)..start],
                block_idx,
                is_last_block,
            )?;
        }

        run.finish(&recovered)
    }
}

impl<'a, O: PaddingOracle + Sync + ?Sized> Cracker<'a, O> {
    /// Crack every block on its own rayon task.
    ///
    /// Each task owns a private copy of the ciphertext up to its target
    /// block and writes into its own chunk of the recovered buffer. The
    /// result, call count included, is the same as for [`Cracker::crack`].
    pub fn crack_parallel(
        &self,
        ciphertext: &[u8],
        block_size: usize,
    ) -> Result<CrackResult, CrackError> {
        let n_blocks = validate_input(ciphertext, block_size)?;
        info!(
            "cracking {} blocks of {block_size} bytes in parallel",
            n_blocks - 1
        );

        let run = CrackRun::new(self, block_size);
        let mut recovered = Zeroizing::new(vec![0u8; ciphertext.len() - block_size]);
        recovered
            .par_chunks_mut(block_size)
            .enumerate()
            .try_for_each(|(i, recovered_block)| {
                let block_idx = i + 1;
                let start = block_idx * block_size;
                let mut working = WorkingCiphertext::new(&ciphertext[..(start + block_size)]);
                let mut window = working.window(ciphertext, start, block_size);
                run.crack_block(
                    &mut window,
                    recovered_block,
                    block_idx,
                    block_idx == n_blocks - 1,
                )
            })?;

        run.finish(&recovered)
    }
}

/// Crack `ciphertext` with default options.
pub fn crack<O: PaddingOracle + ?Sized>(
    oracle: &O,
    ciphertext: &[u8],
    block_size: usize,
) -> Result<CrackResult, CrackError> {
    Cracker::new(oracle).crack(ciphertext, block_size)
}

fn validate_input(ciphertext: &[u8], block_size: usize) -> Result<usize, CrackError> {
    if !(1..=u8::MAX as usize).contains(&block_size) {
        return Err(CrackError::InvalidInput(format!(
            "block size {block_size} is outside 1..=255"
        )));
    }
    if ciphertext.is_empty() || ciphertext.len() % block_size != 0 {
        return Err(CrackError::InvalidInput(format!(
            "ciphertext length {} is not a positive multiple of {block_size}",
            ciphertext.len()
        )));
    }
    let n_blocks = ciphertext.len() / block_size;
    if n_blocks < 2 {
        return Err(CrackError::InvalidInput(
            "ciphertext needs an IV and at least one data block".to_string(),
        ));
    }
    Ok(n_blocks)
}

/// The state of one crack invocation.
struct CrackRun<'r, 'a, O: ?Sized> {
    cracker: &'r Cracker<'a, O>,
    block_size: usize,
    calls: AtomicUsize,
}

impl<'r, 'a, O: PaddingOracle + ?Sized> CrackRun<'r, 'a, O> {
    fn new(cracker: &'r Cracker<'a, O>, block_size: usize) -> Self {
        Self {
            cracker,
            block_size,
            calls: AtomicUsize::new(0),
        }
    }

    fn crack_block(
        &self,
        window: &mut BlockWindow,
        recovered: &mut [u8],
        block_idx: usize,
        is_last_block: bool,
    ) -> Result<(), CrackError> {
        let block_size = recovered.len();
        for pos in (0..block_size).rev() {
            let padding_len = (block_size - pos) as u8;
            window.force_known_padding(recovered, pos, padding_len);
            recovered[pos] = match self.guess_byte(window, pos, padding_len, is_last_block)? {
                Some(byte) => byte,
                None => self.fallback(block_idx, pos, padding_len, is_last_block)?,
            };
        }
        // The previous block is the next target and must reach the oracle
        // unmodified.
        window.restore();
        debug!("cracked block {block_idx}");
        Ok(())
    }

    fn guess_byte(
        &self,
        window: &mut BlockWindow,
        pos: usize,
        padding_len: u8,
        is_last_block: bool,
    ) -> Result<Option<u8>, CrackError> {
        for guess in 0..=u8::MAX {
            if is_last_block && guess == padding_len {
                continue;
            }
            self.check_cancelled()?;
            window.set_guess(pos, guess, padding_len);
            if !self.ask(window.query()) {
                continue;
            }
            if pos == 0 || self.confirm(window, pos) {
                return Ok(Some(guess));
            }
            trace!("discarded accidental accept of {guess:#04x} at byte {pos}");
        }
        Ok(None)
    }

    // Re-ask with the byte left of `pos` disturbed.
    fn confirm(&self, window: &mut BlockWindow, pos: usize) -> bool {
        window.flip_low_bit(pos - 1);
        let accepted = self.ask(window.query());
        window.flip_low_bit(pos - 1);
        accepted
    }

    fn fallback(
        &self,
        block_idx: usize,
        pos: usize,
        padding_len: u8,
        is_last_block: bool,
    ) -> Result<u8, CrackError> {
        if is_last_block {
            debug!("byte {pos} of last block {block_idx} equals its padding length {padding_len}");
        } else if self.cracker.options.strict {
            return Err(CrackError::OracleInconsistency {
                block: block_idx,
                position: pos,
            });
        } else {
            warn!(
                "oracle accepted no guess for byte {pos} of block {block_idx}, assuming {padding_len:#04x}"
            );
        }
        Ok(padding_len)
    }

    fn ask(&self, candidate: &[u8]) -> bool {
        let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if calls % self.cracker.options.progress_interval.max(1) == 0 {
            self.report(calls);
        }
        self.cracker.oracle.padding_valid(candidate, self.block_size)
    }

    fn check_cancelled(&self) -> Result<(), CrackError> {
        match self.cracker.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(CrackError::Cancelled {
                calls: self.calls.load(Ordering::Relaxed),
            }),
            _ => Ok(()),
        }
    }

    fn report(&self, calls: usize) {
        if let Some(progress) = &self.cracker.progress {
            progress(calls);
        }
    }

    fn finish(&self, recovered: &[u8]) -> Result<CrackResult, CrackError> {
        let oracle_calls = self.calls.load(Ordering::Relaxed);
        self.report(oracle_calls);
        // Block sizes were checked to fit a byte on entry.
        let plaintext = pkcs7_unpad(recovered, self.block_size as u8)?.to_vec();
        info!(
            "recovered {} bytes with {oracle_calls} oracle calls",
            plaintext.len()
        );
        Ok(CrackResult {
            plaintext,
            oracle_calls,
        })
    }
}

/// The private, mutable copy of the ciphertext a crack works on.
///
/// It never aliases the caller's buffer and is wiped when dropped.
struct WorkingCiphertext {
    bytes: Zeroizing<Vec<u8>>,
}

impl WorkingCiphertext {
    fn new(ciphertext: &[u8]) -> Self {
        Self {
            bytes: Zeroizing::new(ciphertext.to_vec()),
        }
    }

    /// Borrow the working copy for cracking the block at `start`.
    ///
    /// The window ends with the target block, so every query presents the
    /// target as the final block to the oracle.
    fn window<'w>(
        &'w mut self,
        original: &'w [u8],
        start: usize,
        block_size: usize,
    ) -> BlockWindow<'w> {
        BlockWindow {
            query: &mut self.bytes[..(start + block_size)],
            original_prev: &original[(start - block_size)..start],
            prev_start: start - block_size,
        }
    }
}

/// A previous/target block pair inside the working ciphertext.
struct BlockWindow<'w> {
    query: &'w mut [u8],
    original_prev: &'w [u8],
    prev_start: usize,
}

impl BlockWindow<'_> {
    fn prev_mut(&mut self) -> &mut [u8] {
        let end = self.prev_start + self.original_prev.len();
        &mut self.query[self.prev_start..end]
    }

    /// Make every byte after `pos` decrypt to `padding_len`.
    fn force_known_padding(&mut self, recovered: &[u8], pos: usize, padding_len: u8) {
        let original_prev = self.original_prev;
        let prev = self.prev_mut();
        for ((byte, original), known) in prev
            .iter_mut()
            .zip(original_prev)
            .zip(recovered)
            .skip(pos + 1)
        {
            *byte = original ^ known ^ padding_len;
        }
    }

    fn set_guess(&mut self, pos: usize, guess: u8, padding_len: u8) {
        let modified = self.original_prev[pos] ^ guess ^ padding_len;
        self.prev_mut()[pos] = modified;
    }

    fn flip_low_bit(&mut self, pos: usize) {
        self.prev_mut()[pos] ^= 0x01;
    }

    fn query(&self) -> &[u8] {
        &*self.query
    }

    fn restore(&mut self) {
        let original_prev = self.original_prev;
        self.prev_mut().copy_from_slice(original_prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use rand::{rngs::StdRng, Rng, SeedableRng};
    use rstest::rstest;

    use crate::{random_key, test_support::ToyCipher, Aes128, CbcPaddingOracle, PaddingError};

    fn aes_oracle(seed: u64) -> (CbcPaddingOracle<Aes128>, StdRng) {
        let mut rng = StdRng::seed_from_u64(seed);
        let oracle = CbcPaddingOracle::new(Aes128::new(&random_key(&mut rng)));
        (oracle, rng)
    }

    fn random_message(rng: &mut StdRng, len: usize) -> Vec<u8> {
        (0..len).map(|_| rng.gen()).collect()
    }

    fn max_calls(ciphertext: &[u8], block_size: usize) -> usize {
        256 * block_size * (ciphertext.len() / block_size - 1) * 2
    }

    #[test]
    fn crack_recovers_single_block_message() {
        let (oracle, mut rng) = aes_oracle(101);
        let message = b"HELLO WORLD!!!!!";
        let ciphertext = oracle.pad_and_encrypt(message, &mut rng).unwrap();

        let result = crack(&oracle, &ciphertext, 16).unwrap();

        assert_eq!(result.plaintext, message);
        assert!((16..=256 * 16).contains(&result.oracle_calls));
    }

    #[test]
    fn crack_recovers_message_spanning_three_blocks() {
        let (oracle, mut rng) = aes_oracle(33);
        let message = b"Cooking MC's like a pound of baco";
        assert_eq!(message.len(), 33);
        let ciphertext = oracle.pad_and_encrypt(message, &mut rng).unwrap();

        let result = crack(&oracle, &ciphertext, 16).unwrap();

        assert_eq!(result.plaintext, message);
    }

    #[rstest]
    #[case(1)]
    #[case(15)]
    #[case(16)]
    #[case(31)]
    #[case(48)]
    fn crack_recovers_random_aes_messages(#[case] len: usize) {
        let (oracle, mut rng) = aes_oracle(len as u64);
        let message = random_message(&mut rng, len);
        let ciphertext = oracle.pad_and_encrypt(&message, &mut rng).unwrap();

        let result = crack(&oracle, &ciphertext, 16).unwrap();

        assert_eq!(result.plaintext, message);
        assert!(result.oracle_calls <= max_calls(&ciphertext, 16));
    }

    #[rstest]
    #[case(0)]
    #[case(7)]
    #[case(8)]
    #[case(9)]
    #[case(16)]
    #[case(23)]
    fn crack_recovers_messages_with_eight_byte_blocks(#[case] len: usize) {
        let mut rng = StdRng::seed_from_u64(len as u64 + 1000);
        let oracle = CbcPaddingOracle::new(ToyCipher::<8>::new(random_key(&mut rng)));
        let message = random_message(&mut rng, len);
        let ciphertext = oracle.pad_and_encrypt(&message, &mut rng).unwrap();

        let result = crack(&oracle, &ciphertext, 8).unwrap();

        assert_eq!(result.plaintext, message);
        assert!(result.oracle_calls <= max_calls(&ciphertext, 8));
    }

    #[test]
    fn crack_discards_accidental_accept_from_neighbouring_byte() {
        let (oracle, mut rng) = aes_oracle(2);
        // The first block ends in 0x02 0x03, so forcing a one byte padding
        // with guess 0 turns the tail into a valid 0x02 0x02 padding.
        let message = b"ABCDEFGHIJKLMN\x02\x03 and one more block";
        let ciphertext = oracle.pad_and_encrypt(message, &mut rng).unwrap();

        let result = crack(&oracle, &ciphertext, 16).unwrap();

        assert_eq!(result.plaintext, message);
    }

    #[test]
    fn crack_leaves_input_untouched() {
        let (oracle, mut rng) = aes_oracle(9);
        let ciphertext = oracle
            .pad_and_encrypt(b"do not touch my buffer", &mut rng)
            .unwrap();
        let copy = ciphertext.clone();

        crack(&oracle, &ciphertext, 16).unwrap();

        assert_eq!(ciphertext, copy);
    }

    #[test]
    fn crack_is_deterministic() {
        let (oracle, mut rng) = aes_oracle(77);
        let message = random_message(&mut rng, 40);
        let ciphertext = oracle.pad_and_encrypt(&message, &mut rng).unwrap();

        let first = crack(&oracle, &ciphertext, 16).unwrap();
        let second = crack(&oracle, &ciphertext, 16).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn crack_parallel_matches_sequential_crack() {
        let (oracle, mut rng) = aes_oracle(55);
        let message = random_message(&mut rng, 70);
        let ciphertext = oracle.pad_and_encrypt(&message, &mut rng).unwrap();
        let cracker = Cracker::new(&oracle);

        let sequential = cracker.crack(&ciphertext, 16).unwrap();
        let parallel = cracker.crack_parallel(&ciphertext, 16).unwrap();

        assert_eq!(parallel.plaintext, message);
        assert_eq!(parallel, sequential);
    }

    #[rstest]
    #[case(0, 32)]
    #[case(256, 512)]
    #[case(16, 0)]
    #[case(16, 40)]
    #[case(16, 16)]
    fn crack_rejects_malformed_input(#[case] block_size: usize, #[case] len: usize) {
        let oracle = |_: &[u8], _: usize| true;

        let result = crack(&oracle, &vec![0u8; len], block_size);

        assert!(matches!(result, Err(CrackError::InvalidInput(_))));
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn fallback_outside_last_block_is_an_error_when_strict(#[case] parallel: bool) {
        let oracle = |_: &[u8], _: usize| false;
        let cracker =
            Cracker::new(&oracle).with_options(CrackOptions::default().with_strict(true));

        // Only block 1 can fail: block 2 is the last one, where falling back
        // is legitimate.
        let result = if parallel {
            cracker.crack_parallel(&[0u8; 48], 16)
        } else {
            cracker.crack(&[0u8; 48], 16)
        };

        assert_eq!(
            result,
            Err(CrackError::OracleInconsistency {
                block: 1,
                position: 15
            })
        );
    }

    #[test]
    fn fallback_outside_last_block_uses_padding_length_when_lenient() {
        let oracle = |_: &[u8], _: usize| false;

        let result = crack(&oracle, &[0u8; 48], 16).unwrap();

        // Every byte falls back to its padding length, so both blocks read
        // 0x10 0x0F ... 0x01 and the final 0x01 is stripped as padding.
        let expected: Vec<u8> = (1..=16u8).rev().chain((2..=16u8).rev()).collect();
        assert_eq!(result.plaintext, expected);
        // The last block skips one guess per byte.
        assert_eq!(result.oracle_calls, 255 * 16 + 256 * 16);
    }

    #[test]
    fn crack_fails_when_recovered_plaintext_is_not_padded() {
        // Accepting everything makes guess 0 win for every byte.
        let oracle = |_: &[u8], _: usize| true;

        let result = crack(&oracle, &[0u8; 32], 16);

        assert_eq!(
            result,
            Err(CrackError::RecoveredPaddingInvalid(
                PaddingError::InvalidPadding
            ))
        );
    }

    #[test]
    fn progress_reports_cumulative_calls() {
        let (oracle, mut rng) = aes_oracle(12);
        let ciphertext = oracle.pad_and_encrypt(b"progress!", &mut rng).unwrap();
        let seen = Mutex::new(Vec::new());
        let cracker = Cracker::new(&oracle)
            .with_options(CrackOptions::default().with_progress_interval(50))
            .with_progress(|calls| seen.lock().unwrap().push(calls));

        let result = cracker.crack(&ciphertext, 16).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&result.oracle_calls));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen[..seen.len() - 1].iter().all(|calls| calls % 50 == 0));
        assert_eq!(seen.len(), result.oracle_calls / 50 + 1);
    }

    #[test]
    fn crack_stops_when_cancelled_up_front() {
        let (oracle, mut rng) = aes_oracle(1);
        let ciphertext = oracle.pad_and_encrypt(b"never cracked", &mut rng).unwrap();
        let cancel = AtomicBool::new(true);

        let result = Cracker::new(&oracle)
            .with_cancellation(&cancel)
            .crack(&ciphertext, 16);

        assert_eq!(result, Err(CrackError::Cancelled { calls: 0 }));
    }

    #[test]
    fn crack_stops_when_cancelled_midway() {
        let (oracle, mut rng) = aes_oracle(4);
        let ciphertext = oracle
            .pad_and_encrypt(&[0xAA; 64], &mut rng)
            .unwrap();
        let cancel = AtomicBool::new(false);
        let cracker = Cracker::new(&oracle)
            .with_options(CrackOptions::default().with_progress_interval(100))
            .with_progress(|calls| {
                if calls >= 300 {
                    cancel.store(true, Ordering::Relaxed);
                }
            })
            .with_cancellation(&cancel);

        let result = cracker.crack_parallel(&ciphertext, 16);

        assert!(matches!(result, Err(CrackError::Cancelled { calls }) if calls >= 300));
    }
}
