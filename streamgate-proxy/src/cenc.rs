//! fMP4 CENC (ClearKey) decryption
//!
//! Walks the ISO BMFF box structure of `init || media` input, strips the
//! protection boxes, restores the clear sample-entry fourcc, adjusts the
//! offsets the removals invalidate, and decrypts samples with AES-128-CTR
//! using the per-sample IVs (and optional subsample partitioning) from
//! `senc`. Boxes outside the touched set pass through byte-for-byte.

use aes::Aes128;
use byteorder::{BigEndian, ByteOrder};
use cipher::{KeyIvInit, StreamCipher};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

#[derive(Debug, thiserror::Error)]
pub enum CencError {
    #[error("Invalid hex in {field}: {source}")]
    InvalidHex {
        field: &'static str,
        source: hex::FromHexError,
    },
    #[error("Key must be 16 bytes, got {0}")]
    BadKeyLength(usize),
    #[error("Truncated box structure at offset {0}")]
    Truncated(usize),
    #[error("Malformed {0} box")]
    Malformed(&'static str),
}

/// Per-sample encryption info parsed from `senc`.
#[derive(Debug, Clone)]
struct SampleInfo {
    iv: Vec<u8>,
    /// `(clear_bytes, encrypted_bytes)` pairs; empty means the whole sample
    /// is encrypted.
    subsamples: Vec<(u16, u32)>,
}

/// A parsed box: fourcc plus payload. Rebuilt boxes are always written with
/// a 32-bit size header.
struct Mp4Box<'a> {
    kind: [u8; 4],
    payload: &'a [u8],
    /// Original encoded bytes, used for byte-for-byte pass-through.
    raw: &'a [u8],
}

struct BoxReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BoxReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn next_box(&mut self) -> Result<Option<Mp4Box<'a>>, CencError> {
        if self.pos + 8 > self.data.len() {
            return Ok(None);
        }
        let start = self.pos;
        let mut size = BigEndian::read_u32(&self.data[start..]) as u64;
        let kind: [u8; 4] = self.data[start + 4..start + 8]
            .try_into()
            .map_err(|_| CencError::Truncated(start))?;
        let mut header = 8usize;

        if size == 1 {
            if start + 16 > self.data.len() {
                return Err(CencError::Truncated(start));
            }
            size = BigEndian::read_u64(&self.data[start + 8..]);
            header = 16;
        } else if size == 0 {
            // Box extends to the end of the enclosing container.
            size = (self.data.len() - start) as u64;
        }

        let size = size as usize;
        if size < header || start + size > self.data.len() {
            return Err(CencError::Truncated(start));
        }

        let parsed = Mp4Box {
            kind,
            payload: &self.data[start + header..start + size],
            raw: &self.data[start..start + size],
        };
        self.pos = start + size;
        Ok(Some(parsed))
    }
}

fn write_box(out: &mut Vec<u8>, kind: [u8; 4], payload: &[u8]) {
    out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(&kind);
    out.extend_from_slice(payload);
}

pub struct Mp4Decryptor {
    /// `kid → key`, insertion-ordered.
    keys: Vec<(Vec<u8>, [u8; 16])>,
    current_key: Option<[u8; 16]>,
    trun_sample_sizes: Vec<u32>,
    sample_infos: Vec<SampleInfo>,
    /// Bytes removed from the current fragment's traf boxes.
    removed_overhead: u32,
}

impl Mp4Decryptor {
    #[must_use]
    pub fn new(keys: Vec<(Vec<u8>, [u8; 16])>) -> Self {
        Self {
            keys,
            current_key: None,
            trun_sample_sizes: Vec::new(),
            sample_infos: Vec::new(),
            removed_overhead: 0,
        }
    }

    /// Decrypt a combined `init || media` byte sequence.
    pub fn decrypt_segment(&mut self, data: &[u8]) -> Result<Vec<u8>, CencError> {
        // Pre-compute the protection overhead removed from traf boxes so a
        // sidx preceding its moof still gets the adjusted reference size.
        let mut reader = BoxReader::new(data);
        while let Some(top) = reader.next_box()? {
            if &top.kind == b"moof" {
                self.removed_overhead = scan_traf_overhead(top.payload)?;
                break;
            }
        }

        let mut out = Vec::with_capacity(data.len());
        let mut reader = BoxReader::new(data);
        while let Some(top) = reader.next_box()? {
            match &top.kind {
                b"moov" => {
                    let rebuilt = self.process_moov(top.payload)?;
                    write_box(&mut out, top.kind, &rebuilt);
                }
                b"moof" => {
                    let rebuilt = self.process_moof(top.payload)?;
                    write_box(&mut out, top.kind, &rebuilt);
                }
                b"sidx" => {
                    let rebuilt = self.process_sidx(top.payload);
                    write_box(&mut out, top.kind, &rebuilt);
                }
                b"mdat" => {
                    let rebuilt = self.decrypt_mdat(top.payload);
                    write_box(&mut out, top.kind, &rebuilt);
                }
                _ => out.extend_from_slice(top.raw),
            }
        }
        Ok(out)
    }

    /// Rebuild moov: drop `pssh` and protection `uuid` boxes, clean each
    /// trak's sample description.
    fn process_moov(&mut self, payload: &[u8]) -> Result<Vec<u8>, CencError> {
        let mut out = Vec::with_capacity(payload.len());
        let mut reader = BoxReader::new(payload);
        while let Some(child) = reader.next_box()? {
            match &child.kind {
                b"pssh" | b"uuid" => {}
                b"trak" => {
                    let rebuilt = self.process_trak(child.payload)?;
                    write_box(&mut out, child.kind, &rebuilt);
                }
                _ => out.extend_from_slice(child.raw),
            }
        }
        Ok(out)
    }

    fn process_trak(&mut self, payload: &[u8]) -> Result<Vec<u8>, CencError> {
        let mut out = Vec::with_capacity(payload.len());
        let mut reader = BoxReader::new(payload);
        while let Some(child) = reader.next_box()? {
            if &child.kind == b"mdia" {
                let rebuilt = self.process_mdia(child.payload)?;
                write_box(&mut out, child.kind, &rebuilt);
            } else {
                out.extend_from_slice(child.raw);
            }
        }
        Ok(out)
    }

    fn process_mdia(&mut self, payload: &[u8]) -> Result<Vec<u8>, CencError> {
        let mut out = Vec::with_capacity(payload.len());
        let mut reader = BoxReader::new(payload);
        while let Some(child) = reader.next_box()? {
            if &child.kind == b"minf" {
                let rebuilt = self.process_minf(child.payload)?;
                write_box(&mut out, child.kind, &rebuilt);
            } else {
                out.extend_from_slice(child.raw);
            }
        }
        Ok(out)
    }

    fn process_minf(&mut self, payload: &[u8]) -> Result<Vec<u8>, CencError> {
        let mut out = Vec::with_capacity(payload.len());
        let mut reader = BoxReader::new(payload);
        while let Some(child) = reader.next_box()? {
            if &child.kind == b"stbl" {
                let rebuilt = self.process_stbl(child.payload)?;
                write_box(&mut out, child.kind, &rebuilt);
            } else {
                out.extend_from_slice(child.raw);
            }
        }
        Ok(out)
    }

    fn process_stbl(&mut self, payload: &[u8]) -> Result<Vec<u8>, CencError> {
        let mut out = Vec::with_capacity(payload.len());
        let mut reader = BoxReader::new(payload);
        while let Some(child) = reader.next_box()? {
            if &child.kind == b"stsd" {
                let rebuilt = self.process_stsd(child.payload)?;
                write_box(&mut out, child.kind, &rebuilt);
            } else {
                out.extend_from_slice(child.raw);
            }
        }
        Ok(out)
    }

    /// Rewrite sample entries: drop `sinf`/`schi`/`tenc`/`schm`, replace the
    /// `encv`/`enca` fourcc with the real format from `frma`.
    fn process_stsd(&mut self, payload: &[u8]) -> Result<Vec<u8>, CencError> {
        if payload.len() < 8 {
            return Err(CencError::Malformed("stsd"));
        }
        let entry_count = BigEndian::read_u32(&payload[4..]);
        let mut out = payload[..8].to_vec();

        let mut reader = BoxReader::new(&payload[8..]);
        for _ in 0..entry_count {
            let Some(entry) = reader.next_box()? else {
                break;
            };
            let (kind, rebuilt) = self.process_sample_entry(&entry)?;
            write_box(&mut out, kind, &rebuilt);
        }
        Ok(out)
    }

    fn process_sample_entry(&mut self, entry: &Mp4Box<'_>) -> Result<([u8; 4], Vec<u8>), CencError> {
        let fixed_len = match &entry.kind {
            b"avc1" | b"encv" | b"hvc1" | b"hev1" => 78,
            b"mp4a" | b"enca" => 28,
            _ => 16,
        };
        if entry.payload.len() < fixed_len {
            return Ok((entry.kind, entry.payload.to_vec()));
        }

        let mut out = entry.payload[..fixed_len].to_vec();
        let mut real_format = None;

        let mut reader = BoxReader::new(&entry.payload[fixed_len..]);
        while let Some(child) = reader.next_box()? {
            match &child.kind {
                b"sinf" => {
                    real_format = extract_frma(child.payload)?;
                }
                b"schi" | b"tenc" | b"schm" => {}
                _ => out.extend_from_slice(child.raw),
            }
        }

        let mut kind = real_format.unwrap_or(entry.kind);
        if &kind == b"encv" {
            kind = *b"avc1";
        }
        if &kind == b"enca" {
            kind = *b"mp4a";
        }
        Ok((kind, out))
    }

    /// Rebuild moof: process each traf, pass other children through.
    fn process_moof(&mut self, payload: &[u8]) -> Result<Vec<u8>, CencError> {
        let mut out = Vec::with_capacity(payload.len());
        let mut reader = BoxReader::new(payload);
        while let Some(child) = reader.next_box()? {
            if &child.kind == b"traf" {
                let rebuilt = self.process_traf(child.payload)?;
                write_box(&mut out, child.kind, &rebuilt);
            } else {
                out.extend_from_slice(child.raw);
            }
        }
        Ok(out)
    }

    /// Drop the encryption boxes from a traf, collect the sample table and
    /// auxiliary data, and shift trun data offsets by the removed bytes.
    fn process_traf(&mut self, payload: &[u8]) -> Result<Vec<u8>, CencError> {
        let mut removed = 0u32;
        let mut sample_count = 0u32;

        // First pass: gather tfhd/trun/senc state.
        let mut reader = BoxReader::new(payload);
        while let Some(child) = reader.next_box()? {
            match &child.kind {
                b"senc" | b"saiz" | b"saio" | b"uuid" => {
                    removed += child.raw.len() as u32;
                }
                _ => {}
            }
            match &child.kind {
                b"tfhd" => {
                    if child.payload.len() >= 8 {
                        let track_id = BigEndian::read_u32(&child.payload[4..]);
                        self.current_key = self.key_for_track(track_id);
                    }
                }
                b"trun" => {
                    sample_count = self.parse_trun(child.payload)?;
                }
                b"senc" => {
                    self.sample_infos = parse_senc(child.payload, sample_count)?;
                }
                _ => {}
            }
        }
        self.removed_overhead = removed;

        // Second pass: rebuild without the encryption boxes.
        let mut out = Vec::with_capacity(payload.len());
        let mut reader = BoxReader::new(payload);
        while let Some(child) = reader.next_box()? {
            match &child.kind {
                b"senc" | b"saiz" | b"saio" | b"uuid" => {}
                b"trun" => {
                    let rebuilt = modify_trun(child.payload, removed);
                    write_box(&mut out, child.kind, &rebuilt);
                }
                _ => out.extend_from_slice(child.raw),
            }
        }
        Ok(out)
    }

    /// Collect per-sample sizes from trun. Samples without an explicit size
    /// record a zero (resolved against the mdat remainder later).
    fn parse_trun(&mut self, payload: &[u8]) -> Result<u32, CencError> {
        if payload.len() < 8 {
            return Err(CencError::Malformed("trun"));
        }
        let flags = BigEndian::read_u32(payload) & 0x00FF_FFFF;
        let sample_count = BigEndian::read_u32(&payload[4..]);
        let mut offset = 8usize;
        if flags & 0x01 != 0 {
            offset += 4; // data offset
        }
        if flags & 0x04 != 0 {
            offset += 4; // first sample flags
        }

        self.trun_sample_sizes.clear();
        for _ in 0..sample_count {
            if flags & 0x100 != 0 {
                offset += 4; // duration
            }
            if flags & 0x200 != 0 {
                if offset + 4 > payload.len() {
                    return Err(CencError::Malformed("trun"));
                }
                self.trun_sample_sizes
                    .push(BigEndian::read_u32(&payload[offset..]));
                offset += 4;
            } else {
                self.trun_sample_sizes.push(0);
            }
            if flags & 0x400 != 0 {
                offset += 4; // sample flags
            }
            if flags & 0x800 != 0 {
                offset += 4; // composition time offset
            }
        }
        Ok(sample_count)
    }

    /// Decrement the sidx referenced size by the removed protection bytes,
    /// preserving the reference-type bit.
    fn process_sidx(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = payload.to_vec();
        if out.len() > 36 {
            let packed = BigEndian::read_u32(&out[32..]);
            let ref_type = packed >> 31;
            let ref_size = (packed & 0x7FFF_FFFF).saturating_sub(self.removed_overhead);
            BigEndian::write_u32(&mut out[32..], (ref_type << 31) | ref_size);
        }
        out
    }

    /// Decrypt the mdat payload sample by sample. Residual bytes after the
    /// last described sample pass through unmodified.
    fn decrypt_mdat(&self, payload: &[u8]) -> Vec<u8> {
        let Some(key) = self.current_key else {
            return payload.to_vec();
        };
        if self.sample_infos.is_empty() {
            return payload.to_vec();
        }

        let mut out = Vec::with_capacity(payload.len());
        let mut pos = 0usize;
        for (index, info) in self.sample_infos.iter().enumerate() {
            let size = match self.trun_sample_sizes.get(index) {
                Some(&s) if s > 0 => s as usize,
                _ => payload.len() - pos,
            };
            if pos + size > payload.len() {
                break;
            }
            out.extend_from_slice(&decrypt_sample(&payload[pos..pos + size], info, &key));
            pos += size;
        }
        if pos < payload.len() {
            out.extend_from_slice(&payload[pos..]);
        }
        out
    }

    /// Single-key streams use their key unconditionally; otherwise the KID
    /// map is consulted with the first entry as fallback.
    fn key_for_track(&self, _track_id: u32) -> Option<[u8; 16]> {
        match self.keys.as_slice() {
            [] => None,
            [(_, key)] => Some(*key),
            [(_, first), ..] => Some(*first),
        }
    }
}

/// Pull the original sample-entry format out of a `sinf` box.
fn extract_frma(sinf_payload: &[u8]) -> Result<Option<[u8; 4]>, CencError> {
    let mut reader = BoxReader::new(sinf_payload);
    while let Some(child) = reader.next_box()? {
        if &child.kind == b"frma" {
            if let Ok(format) = <[u8; 4]>::try_from(&child.payload[..child.payload.len().min(4)]) {
                return Ok(Some(format));
            }
        }
    }
    Ok(None)
}

/// Sum of the encryption-box sizes inside every traf of a moof payload.
fn scan_traf_overhead(moof_payload: &[u8]) -> Result<u32, CencError> {
    let mut removed = 0u32;
    let mut reader = BoxReader::new(moof_payload);
    while let Some(child) = reader.next_box()? {
        if &child.kind == b"traf" {
            let mut inner = BoxReader::new(child.payload);
            while let Some(leaf) = inner.next_box()? {
                if matches!(&leaf.kind, b"senc" | b"saiz" | b"saio" | b"uuid") {
                    removed += leaf.raw.len() as u32;
                }
            }
        }
    }
    Ok(removed)
}

/// Parse `senc`: version/flags, sample count, per-sample 8-byte IV and
/// optional `(clear:u16, encrypted:u32)` subsample runs (flag 0x2).
fn parse_senc(payload: &[u8], trun_sample_count: u32) -> Result<Vec<SampleInfo>, CencError> {
    if payload.len() < 8 {
        return Err(CencError::Malformed("senc"));
    }
    let flags = BigEndian::read_u32(payload) & 0x00FF_FFFF;
    let mut pos = 4usize;
    let mut count = BigEndian::read_u32(&payload[pos..]);
    pos += 4;
    if count == 0 {
        count = trun_sample_count;
    }

    let mut infos = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos + 8 > payload.len() {
            break;
        }
        let iv = payload[pos..pos + 8].to_vec();
        pos += 8;

        let mut subsamples = Vec::new();
        if flags & 0x02 != 0 {
            if pos + 2 > payload.len() {
                break;
            }
            let subsample_count = BigEndian::read_u16(&payload[pos..]);
            pos += 2;
            for _ in 0..subsample_count {
                if pos + 6 > payload.len() {
                    break;
                }
                let clear = BigEndian::read_u16(&payload[pos..]);
                let encrypted = BigEndian::read_u32(&payload[pos + 2..]);
                subsamples.push((clear, encrypted));
                pos += 6;
            }
        }
        infos.push(SampleInfo { iv, subsamples });
    }
    Ok(infos)
}

/// Shift the signed 32-bit data offset by the bytes removed from the traf.
fn modify_trun(payload: &[u8], removed: u32) -> Vec<u8> {
    let mut out = payload.to_vec();
    if out.len() >= 12 {
        let flags = BigEndian::read_u32(&out) & 0x00FF_FFFF;
        if flags & 0x01 != 0 {
            let current = BigEndian::read_i32(&out[8..]);
            BigEndian::write_i32(&mut out[8..], current - removed as i32);
        }
    }
    out
}

/// AES-CTR over one sample. The IV is zero-padded to a 16-byte counter
/// block; with subsamples only the encrypted ranges consume keystream.
fn decrypt_sample(sample: &[u8], info: &SampleInfo, key: &[u8; 16]) -> Vec<u8> {
    let mut counter = [0u8; 16];
    let iv_len = info.iv.len().min(16);
    counter[..iv_len].copy_from_slice(&info.iv[..iv_len]);

    let mut cipher = Aes128Ctr::new(key.into(), &counter.into());
    let mut out = sample.to_vec();

    if info.subsamples.is_empty() {
        cipher.apply_keystream(&mut out);
        return out;
    }

    let mut pos = 0usize;
    for &(clear, encrypted) in &info.subsamples {
        pos += clear as usize;
        let end = (pos + encrypted as usize).min(out.len());
        if pos >= out.len() {
            break;
        }
        cipher.apply_keystream(&mut out[pos..end]);
        pos = end;
    }
    if pos < out.len() {
        cipher.apply_keystream(&mut out[pos..]);
    }
    out
}

/// Decrypt `init || media` with a single ClearKey pair given in hex.
pub fn decrypt_segment(
    init: &[u8],
    media: &[u8],
    key_id_hex: &str,
    key_hex: &str,
) -> Result<Vec<u8>, CencError> {
    let kid = hex::decode(key_id_hex.trim()).map_err(|source| CencError::InvalidHex {
        field: "key_id",
        source,
    })?;
    let key_bytes = hex::decode(key_hex.trim()).map_err(|source| CencError::InvalidHex {
        field: "key",
        source,
    })?;
    let key: [u8; 16] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CencError::BadKeyLength(key_bytes.len()))?;

    let mut combined = Vec::with_capacity(init.len() + media.len());
    combined.extend_from_slice(init);
    combined.extend_from_slice(media);

    Mp4Decryptor::new(vec![(kid, key)]).decrypt_segment(&combined)
}
