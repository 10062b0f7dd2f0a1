//! DV frame synthesis for audio-only sources
//!
//! An audio-only source still has to emit complete DV frames, so it
//! fills a buffer once with a black-video template and then overlays
//! each frame's audio blocks before sending. The template carries the
//! real DIF structure (block ids for every section, DSF flag in the
//! header) while the video payload stays zeroed, i.e. black.
//!
//! Audio data is packed linearly into the nine audio blocks of each
//! sequence: a 5-byte source pack (pack id, sample count, rate code)
//! followed by 72 bytes of big-endian 16-bit interleaved samples.
//! Unused audio payload is zero, i.e. silence.

use super::{
    DvSystem, SampleRate, AUDIO_CHANNELS, DIF_BLOCKS_PER_SEQUENCE, DIF_BLOCK_ID_SIZE,
    DIF_BLOCK_SIZE, DIF_SEQUENCE_SIZE, SCT_AUDIO, SCT_HEADER, SCT_SUBCODE, SCT_VAUX, SCT_VIDEO,
};

/// Audio blocks per DIF sequence
const AUDIO_BLOCKS_PER_SEQUENCE: usize = 9;

/// Audio source pack size at the start of each audio block payload
const AUDIO_PACK_SIZE: usize = 5;

/// Pack id tagging the audio source pack
const AUDIO_PACK_ID: u8 = 0x50;

/// Audio sample bytes per audio block
const AUDIO_BLOCK_DATA_SIZE: usize = DIF_BLOCK_SIZE - DIF_BLOCK_ID_SIZE - AUDIO_PACK_SIZE;

// Block 0 is the header, then two subcode and three VAUX blocks, then
// nine groups of one audio block followed by fifteen video blocks.
fn section_of(dbn: usize) -> (u8, usize) {
    match dbn {
        0 => (SCT_HEADER, 0),
        1..=2 => (SCT_SUBCODE, dbn - 1),
        3..=5 => (SCT_VAUX, dbn - 3),
        _ => {
            let rel = dbn - 6;
            if rel % 16 == 0 {
                (SCT_AUDIO, rel / 16)
            } else {
                (SCT_VIDEO, rel - rel / 16 - 1)
            }
        }
    }
}

fn block_id(sct: u8, dseq: usize, num: usize) -> [u8; DIF_BLOCK_ID_SIZE] {
    [(sct << 5) | 0x1f, ((dseq as u8) << 4) | 0x07, num as u8]
}

const DSF_POS: usize = 3;

/// Fill `buf` with a black frame for `system`.
///
/// `buf` must hold at least one full frame for the system. Only the
/// frame region is touched; the template is ready to send as-is and to
/// take per-frame audio via [`set_audio`].
pub fn fill_dummy(buf: &mut [u8], system: DvSystem) {
    assert!(buf.len() >= system.frame_size(), "buffer smaller than one frame");
    let frame = &mut buf[..system.frame_size()];
    frame.fill(0);
    for dseq in 0..system.seq_count() {
        let seq = &mut frame[dseq * DIF_SEQUENCE_SIZE..][..DIF_SEQUENCE_SIZE];
        for dbn in 0..DIF_BLOCKS_PER_SEQUENCE {
            let (sct, num) = section_of(dbn);
            let id = block_id(sct, dseq, num);
            seq[dbn * DIF_BLOCK_SIZE..][..DIF_BLOCK_ID_SIZE].copy_from_slice(&id);
        }
    }
    if system == DvSystem::System625_50 {
        frame[DSF_POS] = 0x80;
    }
}

/// Overlay one frame's audio into a template previously prepared with
/// [`fill_dummy`].
///
/// `samples` is interleaved 16-bit stereo; its frame count must not
/// exceed the system's audio block capacity (the largest cycle entry
/// always fits). Payload beyond the given samples is zeroed so a short
/// frame ends in silence rather than stale data.
pub fn set_audio(buf: &mut [u8], system: DvSystem, rate: SampleRate, samples: &[i16]) {
    let frame_count = samples.len() / AUDIO_CHANNELS;
    let capacity =
        system.seq_count() * AUDIO_BLOCKS_PER_SEQUENCE * AUDIO_BLOCK_DATA_SIZE / (2 * AUDIO_CHANNELS);
    assert!(frame_count <= capacity, "audio does not fit the frame's audio blocks");

    let rate_code: u8 = match rate {
        SampleRate::Hz48000 => 0,
        SampleRate::Hz32000 => 2,
    };
    let count = frame_count as u16;

    let mut next = 0; // next interleaved sample index
    for dseq in 0..system.seq_count() {
        let seq = &mut buf[dseq * DIF_SEQUENCE_SIZE..][..DIF_SEQUENCE_SIZE];
        for k in 0..AUDIO_BLOCKS_PER_SEQUENCE {
            let dbn = 6 + 16 * k;
            let payload =
                &mut seq[dbn * DIF_BLOCK_SIZE + DIF_BLOCK_ID_SIZE..][..DIF_BLOCK_SIZE - DIF_BLOCK_ID_SIZE];
            payload[0] = AUDIO_PACK_ID;
            payload[1..3].copy_from_slice(&count.to_be_bytes());
            payload[3] = rate_code;
            payload[4] = 0;
            for chunk in payload[AUDIO_PACK_SIZE..].chunks_exact_mut(2) {
                if next < samples.len() {
                    chunk.copy_from_slice(&samples[next].to_be_bytes());
                    next += 1;
                } else {
                    chunk.fill(0);
                }
            }
        }
    }
}
