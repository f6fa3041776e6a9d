/// LDPC code block segmentation for 5G NR
/// Based on 3GPP TS 38.212 Sections 5.2.2 and 6.2.2

use tracing::trace;

/// LDPC base graph types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LdpcBaseGraph {
    /// Base graph 1 - for larger transport blocks
    BaseGraph1,
    /// Base graph 2 - for smaller transport blocks or low rates
    BaseGraph2,
}

/// LDPC lifting size sets as per Table 5.3.2-1
const LIFTING_SIZE_SET: [u32; 51] = [
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 18, 20, 22, 24,
    26, 28, 30, 32, 36, 40, 44, 48, 52, 56, 60, 64, 72, 80, 88, 96, 104,
    112, 120, 128, 144, 160, 176, 192, 208, 224, 240, 256, 288, 320, 352, 384
];

/// Maximum code block size for each base graph
pub const MAX_CB_SIZE_BG1: u32 = 8448;
pub const MAX_CB_SIZE_BG2: u32 = 3840;

/// Code block CRC length
const CB_CRC_BITS: u32 = 24;

/// Segmentation of one transport block into LDPC code blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlockSegmentation {
    /// Base graph type
    pub base_graph: LdpcBaseGraph,
    /// Number of code blocks (C)
    pub num_code_blocks: u32,
    /// Bits per code block including CRC (K')
    pub code_block_size: u32,
    /// Lifting size (Z)
    pub lifting_size: u32,
}

impl CodeBlockSegmentation {
    /// Segment a transport block of `tb_size_bits` sent at `code_rate`
    pub fn new(tb_size_bits: u32, code_rate: f64) -> Self {
        let a = tb_size_bits;
        let base_graph = if a <= 292 || (a <= 3824 && code_rate <= 0.67) || code_rate <= 0.25 {
            LdpcBaseGraph::BaseGraph2
        } else {
            LdpcBaseGraph::BaseGraph1
        };

        // Transport block CRC
        let tb_crc = if a > 3824 { 24 } else { 16 };
        let b = a + tb_crc;

        let k_cb = match base_graph {
            LdpcBaseGraph::BaseGraph1 => MAX_CB_SIZE_BG1,
            LdpcBaseGraph::BaseGraph2 => MAX_CB_SIZE_BG2,
        };

        let (num_code_blocks, b_prime) = if b <= k_cb {
            (1, b)
        } else {
            let c = b.div_ceil(k_cb - CB_CRC_BITS);
            (c, b + c * CB_CRC_BITS)
        };
        let code_block_size = b_prime.div_ceil(num_code_blocks);

        let k_b = match base_graph {
            LdpcBaseGraph::BaseGraph1 => 22,
            LdpcBaseGraph::BaseGraph2 => {
                if b > 640 {
                    10
                } else if b > 560 {
                    9
                } else if b > 192 {
                    8
                } else {
                    6
                }
            }
        };
        let min_z = code_block_size.div_ceil(k_b);
        let lifting_size = LIFTING_SIZE_SET.iter()
            .find(|&&z| z >= min_z)
            .copied()
            .unwrap_or(384);

        trace!(
            "Segmented TB of {} bits (R={:.3}): {:?}, C={}, K'={}, Z={}",
            tb_size_bits, code_rate, base_graph, num_code_blocks, code_block_size, lifting_size
        );

        Self {
            base_graph,
            num_code_blocks,
            code_block_size,
            lifting_size,
        }
    }
}
