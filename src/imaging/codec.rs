//! NIfTI-1 single-file codec.
//!
//! Header and voxel validation is delegated to the `nifti` crate. This module
//! owns gzip framing and the extension list, which is where multilabel
//! segmentations keep their label table.

use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};
use tracing::debug;

use super::error::{CodecError, CodecResult};
use super::label_map::{LABEL_TABLE_ECODE, LabelMap};

const HEADER_SIZE: usize = 348;
const EXTENDER_SIZE: usize = 4;
const SINGLE_FILE_MAGIC: &[u8; 4] = b"n+1\0";
const VOX_OFFSET_POS: usize = 108;

/// Largest uncompressed image `decode` accepts.
pub const DEFAULT_MAX_DECODED_SIZE: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn read_i32(self, bytes: &[u8], at: usize) -> i32 {
        let raw = [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];
        match self {
            ByteOrder::Little => i32::from_le_bytes(raw),
            ByteOrder::Big => i32::from_be_bytes(raw),
        }
    }

    fn i32_bytes(self, value: i32) -> [u8; 4] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }

    fn f32_bytes(self, value: f32) -> [u8; 4] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }
}

/// One header extension block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExtension {
    pub code: i32,
    pub data: Vec<u8>,
}

/// In-memory volumetric image.
#[derive(Debug, Clone)]
pub struct VolumeImage {
    header: NiftiHeader,
    byte_order: ByteOrder,
    extensions: Vec<RawExtension>,
    /// Uncompressed single-file image (header, extensions, voxels).
    bytes: Vec<u8>,
    source: Option<PathBuf>,
}

impl VolumeImage {
    /// Decode an image from (possibly gzip-compressed) bytes.
    pub fn decode(bytes: Vec<u8>) -> CodecResult<Self> {
        Self::decode_bounded(bytes, DEFAULT_MAX_DECODED_SIZE)
    }

    /// Like `decode`, rejecting images whose uncompressed form exceeds
    /// `max_decoded_size` bytes. Gzip input is never inflated past the limit.
    pub fn decode_bounded(bytes: Vec<u8>, max_decoded_size: u64) -> CodecResult<Self> {
        decode_with_source(bytes, None, max_decoded_size)
    }

    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }

    /// Spatial (and further) dimensions, without the leading rank.
    pub fn dims(&self) -> CodecResult<Vec<usize>> {
        let dims = self
            .header
            .dim()
            .map_err(|e| CodecError::not_nifti(e.to_string()))?;
        Ok(dims.iter().map(|d| usize::from(*d)).collect())
    }

    /// Voxel spacing matching `dims`.
    pub fn spacing(&self) -> CodecResult<Vec<f32>> {
        let rank = self.dims()?.len();
        Ok(self.header.pixdim[1..=rank].to_vec())
    }

    pub fn extensions(&self) -> &[RawExtension] {
        &self.extensions
    }

    /// Path this image was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Forget the on-disk origin, e.g. once a scratch file has been removed.
    pub fn into_detached(mut self) -> Self {
        self.source = None;
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn type_name(&self) -> &'static str {
        "Nifti1Image"
    }

    /// Extract the embedded label table.
    pub fn label_map(&self) -> CodecResult<LabelMap> {
        let ext = self
            .extensions
            .iter()
            .find(|ext| LabelMap::is_label_table(&ext.data))
            .ok_or(CodecError::MissingLabelMap)?;

        let text = std::str::from_utf8(&ext.data)
            .map_err(|err| CodecError::MalformedLabelMap(err.to_string()))?;
        LabelMap::from_caret_xml(text.trim_end_matches(['\0', ' ', '\n', '\r', '\t']))
    }

    /// Copy of this image with its label table replaced.
    pub fn with_label_map(&self, labels: &LabelMap) -> CodecResult<Self> {
        let mut extensions: Vec<RawExtension> = self
            .extensions
            .iter()
            .filter(|ext| !LabelMap::is_label_table(&ext.data))
            .cloned()
            .collect();
        extensions.push(RawExtension {
            code: LABEL_TABLE_ECODE,
            data: labels.to_caret_xml().into_bytes(),
        });

        let bytes = self.rebuild(&extensions)?;
        decode_with_source(bytes, None, DEFAULT_MAX_DECODED_SIZE)
    }

    /// Re-serialize with a new extension list, keeping header and voxels.
    fn rebuild(&self, extensions: &[RawExtension]) -> CodecResult<Vec<u8>> {
        let order = self.byte_order;
        let old_offset = self.header.vox_offset as usize;
        let voxels = self
            .bytes
            .get(old_offset..)
            .ok_or_else(|| CodecError::not_nifti("voxel offset beyond end of data"))?;

        let mut blocks = Vec::new();
        for ext in extensions {
            let esize = (8 + ext.data.len()).next_multiple_of(16);
            let esize_i32 = i32::try_from(esize)
                .map_err(|_| CodecError::not_nifti("extension too large"))?;
            blocks.extend_from_slice(&order.i32_bytes(esize_i32));
            blocks.extend_from_slice(&order.i32_bytes(ext.code));
            blocks.extend_from_slice(&ext.data);
            blocks.resize(blocks.len() + esize - 8 - ext.data.len(), 0);
        }

        let vox_offset = HEADER_SIZE + EXTENDER_SIZE + blocks.len();
        let mut out = Vec::with_capacity(vox_offset + voxels.len());
        out.extend_from_slice(&self.bytes[..HEADER_SIZE]);
        out[VOX_OFFSET_POS..VOX_OFFSET_POS + 4].copy_from_slice(&order.f32_bytes(vox_offset as f32));
        let extender = if extensions.is_empty() { 0 } else { 1 };
        out.extend_from_slice(&[extender, 0, 0, 0]);
        out.extend_from_slice(&blocks);
        out.extend_from_slice(voxels);
        Ok(out)
    }
}

/// Read an image from disk.
pub fn load(path: &Path) -> CodecResult<VolumeImage> {
    let bytes = fs::read(path)?;
    debug!("Loaded {} bytes from {}", bytes.len(), path.display());
    decode_with_source(bytes, Some(path.to_path_buf()), DEFAULT_MAX_DECODED_SIZE)
}

/// Write an image to disk, gzip-compressed when the path ends in `.gz`.
/// Parent directories are created as needed.
pub fn save(image: &VolumeImage, path: &Path) -> CodecResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let compressed = path
        .file_name()
        .map(|name| name.to_string_lossy().ends_with(".gz"))
        .unwrap_or(false);

    if compressed {
        let file = fs::File::create(path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(image.as_bytes())?;
        encoder.finish()?;
    } else {
        fs::write(path, image.as_bytes())?;
    }

    debug!("Saved image to {}", path.display());
    Ok(())
}

/// Write an image to disk and return it bound to that path.
pub fn save_as(image: VolumeImage, path: &Path) -> CodecResult<VolumeImage> {
    save(&image, path)?;
    Ok(VolumeImage {
        source: Some(path.to_path_buf()),
        ..image
    })
}

/// Read an image together with its embedded label table.
pub fn load_multilabel(path: &Path) -> CodecResult<(VolumeImage, LabelMap)> {
    let image = load(path)?;
    let labels = image.label_map()?;
    Ok((image, labels))
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

fn decode_with_source(
    bytes: Vec<u8>,
    source: Option<PathBuf>,
    max_decoded_size: u64,
) -> CodecResult<VolumeImage> {
    let too_large =
        || CodecError::not_nifti(format!("image exceeds {max_decoded_size} bytes uncompressed"));

    let bytes = if is_gzip(&bytes) {
        let capacity = (bytes.len() as u64)
            .saturating_mul(4)
            .min(max_decoded_size);
        let mut decompressed = Vec::with_capacity(usize::try_from(capacity).unwrap_or(0));
        GzDecoder::new(Cursor::new(bytes))
            .take(max_decoded_size.saturating_add(1))
            .read_to_end(&mut decompressed)
            .map_err(|e| CodecError::not_nifti(format!("invalid gzip stream: {e}")))?;
        if decompressed.len() as u64 > max_decoded_size {
            return Err(too_large());
        }
        decompressed
    } else {
        if bytes.len() as u64 > max_decoded_size {
            return Err(too_large());
        }
        bytes
    };

    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::not_nifti(format!(
            "file too small ({} bytes, need at least {HEADER_SIZE})",
            bytes.len()
        )));
    }

    let byte_order = if ByteOrder::Little.read_i32(&bytes, 0) == HEADER_SIZE as i32 {
        ByteOrder::Little
    } else if ByteOrder::Big.read_i32(&bytes, 0) == HEADER_SIZE as i32 {
        ByteOrder::Big
    } else {
        return Err(CodecError::not_nifti("unexpected sizeof_hdr"));
    };

    if &bytes[344..348] != SINGLE_FILE_MAGIC {
        return Err(CodecError::not_nifti("missing n+1 magic"));
    }

    let object = InMemNiftiObject::from_reader(Cursor::new(bytes.as_slice()))
        .map_err(|e| CodecError::not_nifti(e.to_string()))?;
    let header = object.header().clone();

    // The reader does not check extension blocks against vox_offset, and
    // voxels must not start inside one.
    let vox_offset = header.vox_offset as usize;
    if vox_offset > bytes.len() {
        return Err(CodecError::not_nifti("voxel offset beyond end of data"));
    }
    let room = vox_offset.saturating_sub(HEADER_SIZE + EXTENDER_SIZE);
    let claimed: usize = object
        .extensions()
        .iter()
        .map(|ext| usize::try_from(ext.size()).unwrap_or(usize::MAX))
        .fold(0, usize::saturating_add);
    if claimed > room {
        return Err(CodecError::not_nifti("extension overruns voxel data"));
    }

    let extensions = object
        .extensions()
        .iter()
        .map(|ext| RawExtension {
            code: ext.code(),
            data: ext.data().clone(),
        })
        .collect();

    Ok(VolumeImage {
        header,
        byte_order,
        extensions,
        bytes,
        source,
    })
}
