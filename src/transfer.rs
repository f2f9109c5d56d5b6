//! Chunked image transfer.
//!
//! Images leave the process as ordered text messages small enough for the receiving GUI's
//! socket: RGBA bytes, hex encoded, split so that each serialized message stays within
//! `max_message_size`.

use image::{RgbaImage, imageops::FilterType};

use crate::{
    error::{UpliftError, UpliftResult},
    pixels::GeneratedImage,
    protocol::{ImageChunkPayload, TransferStatus, WSMessage},
};

pub const IMAGE_TRANSFER_EVENT: &str = "ImageTransferEvent";
pub const BUFFER_TRANSFER_EVENT: &str = "BufferTransferEvent";
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65535;
pub const PREVIEW_MAX_SIZE: u32 = 256;

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub event_type: String,
    pub name: Option<String>,
    /// Longest side after downscaling; `None` sends the image as is.
    pub max_size: Option<u32>,
    pub max_message_size: usize,
}

impl TransferOptions {
    /// Generation results.
    pub fn result() -> Self {
        Self {
            event_type: IMAGE_TRANSFER_EVENT.to_string(),
            name: None,
            max_size: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Thumbnails of captured buffers.
    pub fn preview(name: impl Into<String>) -> Self {
        Self {
            event_type: BUFFER_TRANSFER_EVENT.to_string(),
            name: Some(name.into()),
            max_size: Some(PREVIEW_MAX_SIZE),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_max_size(mut self, max_size: Option<u32>) -> Self {
        self.max_size = max_size;
        self
    }
}

pub fn generated_image_messages(
    image: &GeneratedImage,
    opts: &TransferOptions,
) -> UpliftResult<Vec<WSMessage<ImageChunkPayload>>> {
    image_messages(&image.to_rgba_image()?, opts)
}

/// Split an image into ordered transfer messages.
pub fn image_messages(
    image: &RgbaImage,
    opts: &TransferOptions,
) -> UpliftResult<Vec<WSMessage<ImageChunkPayload>>> {
    let status = if image.as_raw().iter().all(|&b| b == 0) {
        TransferStatus::Error
    } else {
        TransferStatus::Success
    };

    let image = match opts.max_size {
        Some(max) if max > 0 && image.width().max(image.height()) > max => {
            let scale = max as f64 / image.width().max(image.height()) as f64;
            let w = ((image.width() as f64 * scale) as u32).max(1);
            let h = ((image.height() as f64 * scale) as u32).max(1);
            image::imageops::resize(image, w, h, FilterType::Lanczos3)
        }
        _ => image.clone(),
    };
    let (width, height) = image.dimensions();
    let bytes = image.into_raw();

    let sample = WSMessage::new(
        opts.event_type.clone(),
        Some(ImageChunkPayload {
            width,
            height,
            part: 999,
            total_parts: 999,
            status,
            name: opts.name.clone(),
            data: String::new(),
        }),
    );
    let metadata_size = serde_json::to_string(&sample)
        .map_err(anyhow::Error::from)?
        .len();
    let max_data = opts.max_message_size.saturating_sub(metadata_size) / 2;
    if max_data == 0 {
        return Err(UpliftError::config(format!(
            "max message size {} leaves no room for data ({metadata_size} bytes of metadata)",
            opts.max_message_size
        )));
    }

    let total_parts = bytes.len().div_ceil(max_data);
    let messages = bytes
        .chunks(max_data)
        .enumerate()
        .map(|(part, chunk)| {
            WSMessage::new(
                opts.event_type.clone(),
                Some(ImageChunkPayload {
                    width,
                    height,
                    part,
                    total_parts,
                    status,
                    name: opts.name.clone(),
                    data: to_hex(chunk),
                }),
            )
        })
        .collect();
    Ok(messages)
}

/// Rebuild an image from its chunks (in any order).
pub fn reassemble(chunks: &[ImageChunkPayload]) -> UpliftResult<RgbaImage> {
    let Some(first) = chunks.first() else {
        return Err(UpliftError::decode("no chunks to reassemble"));
    };
    if chunks.len() != first.total_parts {
        return Err(UpliftError::decode(format!(
            "expected {} parts, got {}",
            first.total_parts,
            chunks.len()
        )));
    }

    let mut ordered: Vec<&ImageChunkPayload> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.part);
    let mut bytes = Vec::new();
    for (i, chunk) in ordered.iter().enumerate() {
        if chunk.part != i {
            return Err(UpliftError::decode(format!("missing part {i}")));
        }
        bytes.extend(from_hex(&chunk.data)?);
    }

    RgbaImage::from_raw(first.width, first.height, bytes)
        .ok_or_else(|| UpliftError::decode("reassembled bytes do not match image size"))
}

fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

fn from_hex(text: &str) -> UpliftResult<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(UpliftError::decode("hex payload has odd length"));
    }
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).map_err(|e| UpliftError::decode(e.to_string()))?;
            u8::from_str_radix(s, 16)
                .map_err(|e| UpliftError::decode(format!("invalid hex '{s}': {e}")))
        })
        .collect()
}
