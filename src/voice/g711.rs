//! G.711 u-law and A-law codec
//!
//! Built-in implementation of the [`Codec`] contract so a session can run
//! end to end without an external codec. G.711 companding works per sample,
//! so any sample rate and interleaved channel count are accepted; each
//! sample encodes to exactly one byte.
//!
//! ## Lookup Tables
//!
//! The decode tables are derived from the ITU-T G.711 specification
//! and validated against multiple reference implementations:
//! - ITU-T G.711 (1988): https://www.itu.int/rec/T-REC-G.711
//! - zaf/g711 (MIT): https://github.com/zaf/g711
//! - Sun Microsystems reference (public domain)
//!
//! The encoder follows the segment search of the Sun reference.

use super::codec::{AudioParams, Codec, CodecError, EncodeSession, MAX_DECODED_SAMPLES_PER_CHANNEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711Law {
    ULaw, // PCMU
    ALaw, // PCMA
}

impl G711Law {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pcmu" | "ulaw" | "mulaw" => Some(Self::ULaw),
            "pcma" | "alaw" => Some(Self::ALaw),
            _ => None,
        }
    }
}

/// u-law segment end points (14-bit magnitude, biased)
const ULAW_SEG_END: [i32; 8] = [0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF];
/// A-law segment end points (13-bit magnitude)
const ALAW_SEG_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];
const ULAW_BIAS: i32 = 0x84 >> 2;
const ULAW_CLIP: i32 = 8159;

/// u-law to 16-bit linear PCM lookup table (256 entries)
///
/// Implements ITU-T G.711 Appendix I (PCMU encoding).
/// Values computed from the formula: F(x) = sgn(x) * (exp(|x|*u) - 1) / (exp(u) - 1)
/// where u = 255 (compression parameter for u-law).
#[rustfmt::skip]
const ULAW_TO_PCM: [i16; 256] = [
    -32124, -31100, -30076, -29052, -28028, -27004, -25980, -24956,
    -23932, -22908, -21884, -20860, -19836, -18812, -17788, -16764,
    -15996, -15484, -14972, -14460, -13948, -13436, -12924, -12412,
    -11900, -11388, -10876, -10364,  -9852,  -9340,  -8828,  -8316,
     -7932,  -7676,  -7420,  -7164,  -6908,  -6652,  -6396,  -6140,
     -5884,  -5628,  -5372,  -5116,  -4860,  -4604,  -4348,  -4092,
     -3900,  -3772,  -3644,  -3516,  -3388,  -3260,  -3132,  -3004,
     -2876,  -2748,  -2620,  -2492,  -2364,  -2236,  -2108,  -1980,
     -1884,  -1820,  -1756,  -1692,  -1628,  -1564,  -1500,  -1436,
     -1372,  -1308,  -1244,  -1180,  -1116,  -1052,   -988,   -924,
      -876,   -844,   -812,   -780,   -748,   -716,   -684,   -652,
      -620,   -588,   -556,   -524,   -492,   -460,   -428,   -396,
      -372,   -356,   -340,   -324,   -308,   -292,   -276,   -260,
      -244,   -228,   -212,   -196,   -180,   -164,   -148,   -132,
      -120,   -112,   -104,    -96,    -88,    -80,    -72,    -64,
       -56,    -48,    -40,    -32,    -24,    -16,     -8,      0,
     32124,  31100,  30076,  29052,  28028,  27004,  25980,  24956,
     23932,  22908,  21884,  20860,  19836,  18812,  17788,  16764,
     15996,  15484,  14972,  14460,  13948,  13436,  12924,  12412,
     11900,  11388,  10876,  10364,   9852,   9340,   8828,   8316,
      7932,   7676,   7420,   7164,   6908,   6652,   6396,   6140,
      5884,   5628,   5372,   5116,   4860,   4604,   4348,   4092,
      3900,   3772,   3644,   3516,   3388,   3260,   3132,   3004,
      2876,   2748,   2620,   2492,   2364,   2236,   2108,   1980,
      1884,   1820,   1756,   1692,   1628,   1564,   1500,   1436,
      1372,   1308,   1244,   1180,   1116,   1052,    988,    924,
       876,    844,    812,    780,    748,    716,    684,    652,
       620,    588,    556,    524,    492,    460,    428,    396,
       372,    356,    340,    324,    308,    292,    276,    260,
       244,    228,    212,    196,    180,    164,    148,    132,
       120,    112,    104,     96,     88,     80,     72,     64,
        56,     48,     40,     32,     24,     16,      8,      0,
];

/// A-law to 16-bit linear PCM lookup table (256 entries)
///
/// Implements ITU-T G.711 Appendix II (PCMA encoding).
/// Values computed from the formula: F(x) = sgn(x) * |x|^(1/A) for |x| < 1/A
/// where A = 87.6 (compression parameter for A-law).
#[rustfmt::skip]
const ALAW_TO_PCM: [i16; 256] = [
     -5504,  -5248,  -6016,  -5760,  -4480,  -4224,  -4992,  -4736,
     -7552,  -7296,  -8064,  -7808,  -6528,  -6272,  -7040,  -6784,
     -2752,  -2624,  -3008,  -2880,  -2240,  -2112,  -2496,  -2368,
     -3776,  -3648,  -4032,  -3904,  -3264,  -3136,  -3520,  -3392,
    -22016, -20992, -24064, -23040, -17920, -16896, -19968, -18944,
    -30208, -29184, -32256, -31232, -26112, -25088, -28160, -27136,
    -11008, -10496, -12032, -11520,  -8960,  -8448,  -9984,  -9472,
    -15104, -14592, -16128, -15616, -13056, -12544, -14080, -13568,
      -344,   -328,   -376,   -360,   -280,   -264,   -312,   -296,
      -472,   -456,   -504,   -488,   -408,   -392,   -440,   -424,
       -88,    -72,   -120,   -104,    -24,     -8,    -56,    -40,
      -216,   -200,   -248,   -232,   -152,   -136,   -184,   -168,
     -1376,  -1312,  -1504,  -1440,  -1120,  -1056,  -1248,  -1184,
     -1888,  -1824,  -2016,  -1952,  -1632,  -1568,  -1760,  -1696,
      -688,   -656,   -752,   -720,   -560,   -528,   -624,   -592,
      -944,   -912,  -1008,   -976,   -816,   -784,   -880,   -848,
      5504,   5248,   6016,   5760,   4480,   4224,   4992,   4736,
      7552,   7296,   8064,   7808,   6528,   6272,   7040,   6784,
      2752,   2624,   3008,   2880,   2240,   2112,   2496,   2368,
      3776,   3648,   4032,   3904,   3264,   3136,   3520,   3392,
     22016,  20992,  24064,  23040,  17920,  16896,  19968,  18944,
     30208,  29184,  32256,  31232,  26112,  25088,  28160,  27136,
     11008,  10496,  12032,  11520,   8960,   8448,   9984,   9472,
     15104,  14592,  16128,  15616,  13056,  12544,  14080,  13568,
       344,    328,    376,    360,    280,    264,    312,    296,
       472,    456,    504,    488,    408,    392,    440,    424,
        88,     72,    120,    104,     24,      8,     56,     40,
       216,    200,    248,    232,    152,    136,    184,    168,
      1376,   1312,   1504,   1440,   1120,   1056,   1248,   1184,
      1888,   1824,   2016,   1952,   1632,   1568,   1760,   1696,
       688,    656,    752,    720,    560,    528,    624,    592,
       944,    912,   1008,    976,    816,    784,    880,    848,
];

#[inline]
fn segment(value: i32, ends: &[i32; 8]) -> usize {
    ends.iter().position(|&end| value <= end).unwrap_or(ends.len())
}

/// Encode one 16-bit linear sample to u-law
#[inline]
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = (sample as i32) >> 2;
    let mask: u8 = if pcm < 0 {
        pcm = -pcm;
        0x7F
    } else {
        0xFF
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let seg = segment(pcm, &ULAW_SEG_END);
    if seg >= 8 {
        return 0x7F ^ mask;
    }
    let uval = ((seg as u8) << 4) | ((pcm >> (seg + 1)) & 0x0F) as u8;
    uval ^ mask
}

/// Encode one 16-bit linear sample to A-law
#[inline]
pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = (sample as i32) >> 3;
    let mask: u8 = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let seg = segment(pcm, &ALAW_SEG_END);
    if seg >= 8 {
        return 0x7F ^ mask;
    }
    let mut aval = (seg as u8) << 4;
    if seg < 2 {
        aval |= ((pcm >> 1) & 0x0F) as u8;
    } else {
        aval |= ((pcm >> seg) & 0x0F) as u8;
    }
    aval ^ mask
}

/// G.711 codec. Stateless, so one instance serves every session.
#[derive(Debug, Clone, Copy)]
pub struct G711 {
    law: G711Law,
}

impl G711 {
    pub fn new(law: G711Law) -> Self {
        Self { law }
    }

    pub fn law(&self) -> G711Law {
        self.law
    }

    #[inline]
    pub fn decode_sample(&self, byte: u8) -> i16 {
        match self.law {
            G711Law::ULaw => ULAW_TO_PCM[byte as usize],
            G711Law::ALaw => ALAW_TO_PCM[byte as usize],
        }
    }

    #[inline]
    pub fn encode_sample(&self, sample: i16) -> u8 {
        match self.law {
            G711Law::ULaw => linear_to_ulaw(sample),
            G711Law::ALaw => linear_to_alaw(sample),
        }
    }

    /// Decode G.711 bytes directly into an existing buffer (avoids per-frame allocation)
    #[inline]
    pub fn decode_into(&self, data: &[u8], output: &mut Vec<i16>) {
        output.reserve(data.len());
        match self.law {
            G711Law::ULaw => output.extend(data.iter().map(|&b| ULAW_TO_PCM[b as usize])),
            G711Law::ALaw => output.extend(data.iter().map(|&b| ALAW_TO_PCM[b as usize])),
        }
    }

    fn check_channels(channels: u16) -> Result<(), CodecError> {
        if channels == 0 || channels > 2 {
            return Err(CodecError::UnsupportedFormat(format!(
                "{} channels (G.711 supports 1 or 2)",
                channels
            )));
        }
        Ok(())
    }
}

struct G711EncodeSession {
    codec: G711,
    channels: u16,
}

impl EncodeSession for G711EncodeSession {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        if pcm.is_empty() {
            return Err(CodecError::EmptyPayload);
        }
        if pcm.len() % self.channels as usize != 0 {
            return Err(CodecError::InvalidFrameLength {
                len: pcm.len(),
                channels: self.channels,
            });
        }
        Ok(pcm.iter().map(|&s| self.codec.encode_sample(s)).collect())
    }
}

impl Codec for G711 {
    fn name(&self) -> &'static str {
        match self.law {
            G711Law::ULaw => "PCMU",
            G711Law::ALaw => "PCMA",
        }
    }

    fn create_encode_session(
        &self,
        params: AudioParams,
    ) -> Result<Box<dyn EncodeSession>, CodecError> {
        Self::check_channels(params.channels)?;
        if params.sample_rate == 0 {
            return Err(CodecError::UnsupportedFormat("sample rate 0".to_string()));
        }
        Ok(Box::new(G711EncodeSession {
            codec: *self,
            channels: params.channels,
        }))
    }

    fn decode(&self, payload: &[u8], _sample_rate: u32, channels: u16) -> Result<Vec<i16>, CodecError> {
        Self::check_channels(channels)?;
        if payload.is_empty() {
            return Err(CodecError::EmptyPayload);
        }
        if payload.len() % channels as usize != 0 {
            return Err(CodecError::InvalidFrameLength {
                len: payload.len(),
                channels,
            });
        }
        let per_channel = payload.len() / channels as usize;
        if per_channel > MAX_DECODED_SAMPLES_PER_CHANNEL {
            return Err(CodecError::PayloadTooLarge {
                samples: per_channel,
                max: MAX_DECODED_SAMPLES_PER_CHANNEL,
            });
        }

        let mut output = Vec::with_capacity(payload.len());
        self.decode_into(payload, &mut output);
        Ok(output)
    }
}



/// Kani formal verification proofs
/// Run with: cargo kani --tests
#[cfg(kani)]
mod kani_proofs {
    use super::*;

    /// Proves: u-law encoding never panics for any i16 input
    #[kani::proof]
    fn ulaw_encode_never_panics() {
        let sample: i16 = kani::any();
        let _ = linear_to_ulaw(sample);
    }

    /// Proves: A-law encoding never panics for any i16 input
    #[kani::proof]
    fn alaw_encode_never_panics() {
        let sample: i16 = kani::any();
        let _ = linear_to_alaw(sample);
    }

    /// Proves: A-law symmetry - indices i and i+128 have opposite signs
    #[kani::proof]
    fn alaw_symmetry_proof() {
        let i: u8 = kani::any();
        kani::assume(i < 128);

        let neg = ALAW_TO_PCM[i as usize];
        let pos = ALAW_TO_PCM[(i + 128) as usize];

        kani::assert(neg == -pos, "A-law must be symmetric");
    }
}
