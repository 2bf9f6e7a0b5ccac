//! Binary weights for one native enhancement stage.
//!
//! Layout (little-endian):
//! ```text
//! magic "VXST" | version u32 | endian u8 | dtype u8
//! frame_size u32 | features u32 | hidden u32 | tensor_count u32
//! tensor table: name_len u16, name, ndim u8, dims u32 * ndim,
//!               offset_bytes u32, len_elements u32
//! payload: f32 tensors back to back (dtype must be 0)
//! ```
//! Dense kernels are stored input-major (`[in, out]`), LSTM gate matrices
//! gate-major (`[4h, in]`) with gates in i, o, f, g order.

use anyhow::{anyhow, bail, Context};
use std::convert::TryInto;
use std::io::{Cursor, Read};
use std::path::Path;

const MAGIC: [u8; 4] = *b"VXST";
const VERSION: u32 = 1;
const ENDIANNESS_LITTLE: u8 = 0;
const DTYPE_F32: u8 = 0;
const F32_BYTES: usize = 4;
const GATES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dim {
    Frame,
    Features,
    Hidden,
    Gates,
}

struct TensorSpec {
    name: &'static str,
    shape: &'static [Dim],
}

const TENSOR_ORDER: [TensorSpec; 12] = [
    TensorSpec {
        name: "encoder",
        shape: &[Dim::Frame, Dim::Features],
    },
    TensorSpec {
        name: "norm_mul",
        shape: &[Dim::Features],
    },
    TensorSpec {
        name: "norm_add",
        shape: &[Dim::Features],
    },
    TensorSpec {
        name: "lstm0_w",
        shape: &[Dim::Gates, Dim::Features],
    },
    TensorSpec {
        name: "lstm0_r",
        shape: &[Dim::Gates, Dim::Hidden],
    },
    TensorSpec {
        name: "lstm0_b",
        shape: &[Dim::Gates],
    },
    TensorSpec {
        name: "lstm1_w",
        shape: &[Dim::Gates, Dim::Hidden],
    },
    TensorSpec {
        name: "lstm1_r",
        shape: &[Dim::Gates, Dim::Hidden],
    },
    TensorSpec {
        name: "lstm1_b",
        shape: &[Dim::Gates],
    },
    TensorSpec {
        name: "mask_kernel",
        shape: &[Dim::Hidden, Dim::Features],
    },
    TensorSpec {
        name: "mask_bias",
        shape: &[Dim::Features],
    },
    TensorSpec {
        name: "decoder",
        shape: &[Dim::Features, Dim::Frame],
    },
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageDims {
    pub frame_size: usize,
    pub features: usize,
    pub hidden: usize,
}

impl StageDims {
    fn resolve(&self, dim: Dim) -> usize {
        match dim {
            Dim::Frame => self.frame_size,
            Dim::Features => self.features,
            Dim::Hidden => self.hidden,
            Dim::Gates => GATES * self.hidden,
        }
    }

    fn shape_of(&self, spec: &TensorSpec) -> Vec<usize> {
        spec.shape.iter().map(|&d| self.resolve(d)).collect()
    }
}

#[derive(Debug)]
struct TableEntry {
    name: String,
    shape: Vec<usize>,
    offset_bytes: usize,
    len_elements: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LstmLayer {
    pub w: Box<[f32]>,
    pub r: Box<[f32]>,
    pub bias: Box<[f32]>,
    pub input_size: usize,
    pub hidden_size: usize,
}

impl LstmLayer {
    fn new(w: Box<[f32]>, r: Box<[f32]>, bias: Box<[f32]>, input_size: usize) -> anyhow::Result<Self> {
        if input_size == 0 || w.len() % (GATES * input_size) != 0 {
            return Err(anyhow!("LSTM weight shape does not align with input size"));
        }
        let hidden_size = w.len() / (GATES * input_size);
        if hidden_size == 0 {
            return Err(anyhow!("LSTM hidden size computed as zero"));
        }
        if r.len() != GATES * hidden_size * hidden_size {
            return Err(anyhow!("LSTM recurrent matrix has unexpected length"));
        }
        if bias.len() != GATES * hidden_size {
            return Err(anyhow!("LSTM bias requires 4h entries"));
        }
        Ok(Self {
            w,
            r,
            bias,
            input_size,
            hidden_size,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }
}

/// Every tensor one stage needs.
#[derive(Clone, Debug, PartialEq)]
pub struct StageWeights {
    pub dims: StageDims,
    pub encoder: Box<[f32]>,
    pub norm_mul: Box<[f32]>,
    pub norm_add: Box<[f32]>,
    pub lstm0: LstmLayer,
    pub lstm1: LstmLayer,
    pub mask_kernel: Box<[f32]>,
    pub mask_bias: Box<[f32]>,
    pub decoder: Box<[f32]>,
}

impl StageWeights {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let blob = std::fs::read(path)
            .with_context(|| format!("reading stage weights {}", path.display()))?;
        Self::from_bytes(&blob).with_context(|| format!("parsing stage weights {}", path.display()))
    }

    pub fn from_bytes(blob: &[u8]) -> anyhow::Result<Self> {
        let mut cursor = Cursor::new(blob);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(anyhow!("stage weights magic mismatch"));
        }

        let version = read_u32(&mut cursor)?;
        if version != VERSION {
            return Err(anyhow!("Unsupported stage weights version {version}"));
        }

        let endian = read_u8(&mut cursor)?;
        if endian != ENDIANNESS_LITTLE {
            return Err(anyhow!("Only little-endian blobs supported"));
        }

        let dtype = read_u8(&mut cursor)?;
        if dtype != DTYPE_F32 {
            return Err(anyhow!("Unsupported tensor dtype {dtype}, only f32 weights are read"));
        }

        let dims = StageDims {
            frame_size: read_u32(&mut cursor)? as usize,
            features: read_u32(&mut cursor)? as usize,
            hidden: read_u32(&mut cursor)? as usize,
        };
        if dims.frame_size == 0 || dims.features == 0 || dims.hidden == 0 {
            bail!("stage dimensions must be non-zero: {dims:?}");
        }

        let tensor_count = read_u32(&mut cursor)? as usize;
        if tensor_count != TENSOR_ORDER.len() {
            return Err(anyhow!(
                "Expected {} tensors, found {}",
                TENSOR_ORDER.len(),
                tensor_count
            ));
        }

        let mut entries = Vec::with_capacity(tensor_count);
        for _ in 0..tensor_count {
            entries.push(read_table_entry(&mut cursor)?);
        }

        let data_start = cursor.position() as usize;
        let data_section = blob
            .get(data_start..)
            .context("stage weights truncated after tensor table")?;

        let mut tensors = Vec::with_capacity(tensor_count);
        for (spec, entry) in TENSOR_ORDER.iter().zip(entries.iter()) {
            if spec.name != entry.name {
                return Err(anyhow!(
                    "Tensor order mismatch: expected {}, saw {}",
                    spec.name,
                    entry.name
                ));
            }

            let expected = dims.shape_of(spec);
            if expected != entry.shape {
                return Err(anyhow!(
                    "Shape mismatch for {}: expected {:?}, got {:?}",
                    entry.name,
                    expected,
                    entry.shape
                ));
            }

            let total_elems = shape_product(&entry.shape)
                .ok_or_else(|| anyhow!("Shape overflow for {}", entry.name))?;
            if total_elems != entry.len_elements {
                return Err(anyhow!(
                    "{} claims {} elements but table says {}",
                    entry.name,
                    total_elems,
                    entry.len_elements
                ));
            }

            let bytes_len = F32_BYTES
                .checked_mul(entry.len_elements)
                .ok_or_else(|| anyhow!("Byte count overflow for {}", entry.name))?;
            let end = entry
                .offset_bytes
                .checked_add(bytes_len)
                .ok_or_else(|| anyhow!("Offset overflow for {}", entry.name))?;
            let data = data_section
                .get(entry.offset_bytes..end)
                .with_context(|| format!("{} lies outside blob bounds", entry.name))?;

            tensors.push(parse_tensor_data(data, entry.len_elements)?);
        }

        let mut iter = tensors.into_iter();
        let mut next = |name: &str| {
            iter.next()
                .ok_or_else(|| anyhow!("missing tensor {name}"))
        };

        let encoder = next("encoder")?;
        let norm_mul = next("norm_mul")?;
        let norm_add = next("norm_add")?;
        let lstm0 = LstmLayer::new(
            next("lstm0_w")?,
            next("lstm0_r")?,
            next("lstm0_b")?,
            dims.features,
        )?;
        let lstm1 = LstmLayer::new(
            next("lstm1_w")?,
            next("lstm1_r")?,
            next("lstm1_b")?,
            dims.hidden,
        )?;
        let mask_kernel = next("mask_kernel")?;
        let mask_bias = next("mask_bias")?;
        let decoder = next("decoder")?;

        Ok(Self {
            dims,
            encoder,
            norm_mul,
            norm_add,
            lstm0,
            lstm1,
            mask_kernel,
            mask_bias,
            decoder,
        })
    }

    /// Serialise as an f32 blob that `from_bytes` accepts.
    pub fn to_bytes(&self) -> Vec<u8> {
        let tensors: [&[f32]; 12] = [
            &self.encoder,
            &self.norm_mul,
            &self.norm_add,
            &self.lstm0.w,
            &self.lstm0.r,
            &self.lstm0.bias,
            &self.lstm1.w,
            &self.lstm1.r,
            &self.lstm1.bias,
            &self.mask_kernel,
            &self.mask_bias,
            &self.decoder,
        ];

        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.push(ENDIANNESS_LITTLE);
        out.push(DTYPE_F32);
        out.extend_from_slice(&(self.dims.frame_size as u32).to_le_bytes());
        out.extend_from_slice(&(self.dims.features as u32).to_le_bytes());
        out.extend_from_slice(&(self.dims.hidden as u32).to_le_bytes());
        out.extend_from_slice(&(TENSOR_ORDER.len() as u32).to_le_bytes());

        let mut offset = 0usize;
        for (spec, tensor) in TENSOR_ORDER.iter().zip(tensors.iter()) {
            let shape = self.dims.shape_of(spec);
            out.extend_from_slice(&(spec.name.len() as u16).to_le_bytes());
            out.extend_from_slice(spec.name.as_bytes());
            out.push(shape.len() as u8);
            for dim in &shape {
                out.extend_from_slice(&(*dim as u32).to_le_bytes());
            }
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            out.extend_from_slice(&(tensor.len() as u32).to_le_bytes());
            offset += tensor.len() * F32_BYTES;
        }
        for tensor in tensors {
            for v in tensor {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out
    }

    /// Weights whose stage passes audio through unchanged: identity encoder
    /// and decoder, a saturated mask, zero LSTM weights. Needs
    /// `features == frame_size`.
    pub fn passthrough(frame_size: usize, hidden: usize) -> Self {
        let dims = StageDims {
            frame_size,
            features: frame_size,
            hidden,
        };
        let mut eye = vec![0.0f32; frame_size * frame_size];
        for i in 0..frame_size {
            eye[i * frame_size + i] = 1.0;
        }
        let zeros = |n: usize| vec![0.0f32; n].into_boxed_slice();
        let gates = GATES * hidden;
        Self {
            dims,
            encoder: eye.clone().into_boxed_slice(),
            // Zero gain after normalisation keeps the LSTM input at zero.
            norm_mul: zeros(frame_size),
            norm_add: zeros(frame_size),
            lstm0: LstmLayer {
                w: zeros(gates * frame_size),
                r: zeros(gates * hidden),
                bias: zeros(gates),
                input_size: frame_size,
                hidden_size: hidden,
            },
            lstm1: LstmLayer {
                w: zeros(gates * hidden),
                r: zeros(gates * hidden),
                bias: zeros(gates),
                input_size: hidden,
                hidden_size: hidden,
            },
            mask_kernel: zeros(hidden * frame_size),
            mask_bias: vec![30.0f32; frame_size].into_boxed_slice(),
            decoder: eye.into_boxed_slice(),
        }
    }
}

fn shape_product(shape: &[usize]) -> Option<usize> {
    shape
        .iter()
        .copied()
        .try_fold(1usize, |acc, dim| acc.checked_mul(dim))
}

fn parse_tensor_data(data: &[u8], len: usize) -> anyhow::Result<Box<[f32]>> {
    let mut vec = Vec::with_capacity(len);
    for chunk in data.chunks_exact(F32_BYTES) {
        let array: [u8; 4] = chunk.try_into()?;
        vec.push(f32::from_le_bytes(array));
    }
    Ok(vec.into_boxed_slice())
}

fn read_table_entry(cursor: &mut Cursor<&[u8]>) -> anyhow::Result<TableEntry> {
    let name_len = read_u16(cursor)? as usize;
    let mut name_bytes = vec![0u8; name_len];
    cursor.read_exact(&mut name_bytes)?;
    let name = String::from_utf8(name_bytes)?;

    let ndim = read_u8(cursor)? as usize;
    let mut shape = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        shape.push(read_u32(cursor)? as usize);
    }

    let offset_bytes = read_u32(cursor)? as usize;
    let len_elements = read_u32(cursor)? as usize;
    Ok(TableEntry {
        name,
        shape,
        offset_bytes,
        len_elements,
    })
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> anyhow::Result<u8> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> anyhow::Result<u16> {
    let mut buf = [0u8; 2];
    cursor.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> anyhow::Result<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
