//! Language-aware chunking: extension-dispatched strategies producing
//! logical blocks, and a token budgeter that packs blocks into chunks.
//!
//! Strategies are pure functions over file text; the budgeter owns the
//! sizing rules (target tokens, overlap, symbol cap, hard cap with
//! line-splitting). Chunk ids use a per-file counter so ids stay stable
//! when unrelated files are added elsewhere in the tree.

use std::collections::BTreeMap;

use crate::build::scanner::SourceFile;
use crate::config::BuildConfig;
use crate::hash::sha256_hex;
use crate::packet::types::DocChunk;

/// Estimate token count from text (1 token ~= 4 characters).
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

/// Logical block kinds produced by the strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Preamble,
    Symbol,
    SymbolChild,
    Section,
    Paragraph,
}

impl BlockKind {
    fn as_str(self) -> &'static str {
        match self {
            BlockKind::Preamble => "preamble",
            BlockKind::Symbol => "symbol",
            BlockKind::SymbolChild => "symbol-child",
            BlockKind::Section => "section",
            BlockKind::Paragraph => "paragraph",
        }
    }

    fn counts_as_symbol(self) -> bool {
        matches!(self, BlockKind::Symbol | BlockKind::SymbolChild)
    }
}

/// One logical block in source order, 1-based inclusive line range.
#[derive(Debug, Clone)]
struct Block {
    text: String,
    line_start: usize,
    line_end: usize,
    kind: BlockKind,
    symbol: Option<String>,
}

/// One packed chunk before it becomes a DocChunk.
#[derive(Debug, Clone)]
struct Packed {
    text: String,
    line_start: usize,
    line_end: usize,
    kind: BlockKind,
    symbol: Option<String>,
}

/// Chunk one source file into an ordered sequence of DocChunks.
///
/// Parent chunks come from the budgeter; when `micro_chunk_tokens` is set,
/// oversized parents are additionally expanded into child chunks carrying
/// `parent_id` and `child_index` metadata. The per-file counter covers
/// parents and children alike.
pub fn chunk_file(file: &SourceFile, config: &BuildConfig) -> Vec<DocChunk> {
    let blocks = match file.ext.as_str() {
        "md" | "rst" => markdown_blocks(&file.text),
        "rs" | "py" | "ts" | "tsx" | "js" | "jsx" | "go" | "java" | "c" | "h" | "cpp" | "hpp"
        | "cs" | "rb" | "sh" => code_blocks(&file.text, &file.ext),
        _ => text_blocks(&file.text),
    };

    let packed = pack_blocks(&blocks, config);

    let mut chunks = Vec::new();
    let mut counter = 0usize;
    for parent in packed {
        let parent_id = format!("{}:{}", file.relpath, counter);
        counter += 1;
        chunks.push(make_chunk(&parent_id, file, &parent, None, None));

        if config.micro_chunk_tokens > 0
            && estimate_tokens(&parent.text) > config.micro_chunk_tokens
        {
            let pieces = split_by_lines(&parent.text, config.micro_chunk_tokens);
            for (child_index, piece) in pieces.into_iter().enumerate() {
                let child = Packed {
                    text: piece,
                    line_start: parent.line_start,
                    line_end: parent.line_end,
                    kind: parent.kind,
                    symbol: parent.symbol.clone(),
                };
                let child_id = format!("{}:{}", file.relpath, counter);
                counter += 1;
                chunks.push(make_chunk(
                    &child_id,
                    file,
                    &child,
                    Some(&parent_id),
                    Some(child_index),
                ));
            }
        }
    }
    chunks
}

fn make_chunk(
    id: &str,
    file: &SourceFile,
    packed: &Packed,
    parent_id: Option<&str>,
    child_index: Option<usize>,
) -> DocChunk {
    let mut metadata = BTreeMap::new();
    metadata.insert("path".to_string(), serde_json::json!(file.relpath));
    metadata.insert("ext".to_string(), serde_json::json!(file.ext));
    metadata.insert("line_start".to_string(), serde_json::json!(packed.line_start));
    metadata.insert("line_end".to_string(), serde_json::json!(packed.line_end));
    let kind = if child_index.is_some() { "child" } else { packed.kind.as_str() };
    metadata.insert("kind".to_string(), serde_json::json!(kind));
    if let Some(symbol) = &packed.symbol {
        metadata.insert("symbol".to_string(), serde_json::json!(symbol));
    }
    if is_code_ext(&file.ext) {
        metadata.insert("lang".to_string(), serde_json::json!(file.ext));
    }
    if let Some(parent) = parent_id {
        metadata.insert("parent_id".to_string(), serde_json::json!(parent));
    }
    if let Some(index) = child_index {
        metadata.insert("child_index".to_string(), serde_json::json!(index));
    }

    DocChunk {
        id: id.to_string(),
        text: packed.text.clone(),
        hash: sha256_hex(packed.text.as_bytes()),
        metadata,
    }
}

fn is_code_ext(ext: &str) -> bool {
    matches!(
        ext,
        "rs" | "py" | "ts" | "tsx" | "js" | "jsx" | "go" | "java" | "c" | "h" | "cpp" | "hpp"
            | "cs" | "rb" | "sh"
    )
}

/// Pack blocks into chunks obeying the budgeter contract:
/// target size, overlap between adjacent chunks, symbol-block cap, and a
/// hard cap that line-splits any oversize block. Source order is preserved;
/// the overlap is a suffix of the previous chunk prepended to the next.
fn pack_blocks(blocks: &[Block], config: &BuildConfig) -> Vec<Packed> {
    // Expand blocks that exceed the hard cap into line-split pieces first.
    let mut expanded: Vec<Block> = Vec::new();
    for block in blocks {
        if estimate_tokens(&block.text) > config.hard_cap_tokens {
            let pieces = split_by_lines(&block.text, config.chunk_tokens);
            let mut line = block.line_start;
            for piece in pieces {
                let lines = piece.lines().count().max(1);
                expanded.push(Block {
                    text: piece,
                    line_start: line,
                    line_end: (line + lines - 1).min(block.line_end),
                    kind: block.kind,
                    symbol: block.symbol.clone(),
                });
                line += lines;
            }
        } else {
            expanded.push(block.clone());
        }
    }

    let mut packed: Vec<Packed> = Vec::new();
    let mut current: Option<Packed> = None;
    let mut symbol_count = 0usize;
    let mut carry: String = String::new();

    for block in &expanded {
        let block_tokens = estimate_tokens(&block.text);
        let flush = match &current {
            None => false,
            Some(chunk) => {
                let over_budget =
                    estimate_tokens(&chunk.text) + block_tokens > config.chunk_tokens;
                let over_symbols = block.kind.counts_as_symbol()
                    && symbol_count >= config.max_symbol_blocks_per_chunk;
                over_budget || over_symbols
            }
        };

        if flush {
            if let Some(chunk) = current.take() {
                carry = overlap_suffix(&chunk.text, config.overlap_tokens);
                packed.push(chunk);
            }
            symbol_count = 0;
        }

        match current.as_mut() {
            Some(chunk) => {
                chunk.text.push('\n');
                chunk.text.push_str(&block.text);
                chunk.line_end = block.line_end;
                if chunk.symbol.is_none() {
                    chunk.symbol = block.symbol.clone();
                }
            }
            None => {
                let mut text = String::new();
                if !carry.is_empty() {
                    text.push_str(&carry);
                    text.push('\n');
                }
                text.push_str(&block.text);
                current = Some(Packed {
                    text,
                    line_start: block.line_start,
                    line_end: block.line_end,
                    kind: block.kind,
                    symbol: block.symbol.clone(),
                });
            }
        }
        if block.kind.counts_as_symbol() {
            symbol_count += 1;
        }
    }

    if let Some(chunk) = current {
        packed.push(chunk);
    }
    packed
}

/// Suffix of `text` worth roughly `overlap_tokens`, cut at a char boundary
/// and preferring a line boundary when one is close.
fn overlap_suffix(text: &str, overlap_tokens: usize) -> String {
    if overlap_tokens == 0 || text.is_empty() {
        return String::new();
    }
    let want = overlap_tokens * 4;
    if text.len() <= want {
        return text.to_string();
    }
    let mut start = text.len() - want;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    // Prefer starting after a newline inside the window.
    if let Some(nl) = text[start..].find('\n') {
        if nl + 1 < text.len() - start {
            return text[start + nl + 1..].to_string();
        }
    }
    text[start..].to_string()
}

/// Split text into pieces of at most `budget_tokens`, cutting only at line
/// boundaries. A single line longer than the budget becomes its own piece.
fn split_by_lines(text: &str, budget_tokens: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        let candidate_len = if current.is_empty() {
            line.len()
        } else {
            current.len() + 1 + line.len()
        };
        if !current.is_empty() && estimate_tokens_for_len(candidate_len) > budget_tokens {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn estimate_tokens_for_len(len: usize) -> usize {
    (len + 3) / 4
}

// --- strategies ---

/// Code strategy: top-level definition lines start Symbol blocks, indented
/// definition lines start SymbolChild blocks, everything before the first
/// definition is the preamble.
fn code_blocks(text: &str, ext: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut current: Option<Block> = None;

    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        let trimmed = line.trim_start();
        let indented = line.len() > trimmed.len();
        let symbol = symbol_name(trimmed, ext);

        if let Some(name) = symbol {
            let kind = if indented { BlockKind::SymbolChild } else { BlockKind::Symbol };
            if let Some(block) = current.take() {
                blocks.push(block);
            }
            current = Some(Block {
                text: line.to_string(),
                line_start: line_no,
                line_end: line_no,
                kind,
                symbol: Some(name),
            });
        } else {
            match current.as_mut() {
                Some(block) => {
                    block.text.push('\n');
                    block.text.push_str(line);
                    block.line_end = line_no;
                }
                None => {
                    current = Some(Block {
                        text: line.to_string(),
                        line_start: line_no,
                        line_end: line_no,
                        kind: BlockKind::Preamble,
                        symbol: None,
                    });
                }
            }
        }
    }
    if let Some(block) = current {
        blocks.push(block);
    }
    blocks
}

/// Extract a symbol name when the (trimmed) line opens a definition.
fn symbol_name(trimmed: &str, ext: &str) -> Option<String> {
    let keywords: &[&str] = match ext {
        "py" => &["def ", "class ", "async def "],
        "rs" => &["fn ", "pub fn ", "pub(crate) fn ", "struct ", "pub struct ", "enum ",
            "pub enum ", "trait ", "pub trait ", "impl "],
        "go" => &["func ", "type "],
        "ts" | "tsx" | "js" | "jsx" => &["function ", "export function ", "class ",
            "export class ", "interface ", "export interface "],
        "java" | "cs" => &["public class ", "class ", "interface ", "public interface "],
        "rb" => &["def ", "class ", "module "],
        _ => &["fn ", "def ", "class ", "func ", "function "],
    };

    for keyword in keywords {
        if let Some(rest) = trimmed.strip_prefix(keyword) {
            let name: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
                .collect();
            if !name.is_empty() {
                return Some(name);
            }
        }
    }
    None
}

/// Markdown strategy: one Section block per heading, preamble before the
/// first heading.
fn markdown_blocks(text: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut current: Option<Block> = None;

    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        if line.starts_with('#') {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
            let heading = line.trim_start_matches('#').trim().to_string();
            current = Some(Block {
                text: line.to_string(),
                line_start: line_no,
                line_end: line_no,
                kind: BlockKind::Section,
                symbol: if heading.is_empty() { None } else { Some(heading) },
            });
        } else {
            match current.as_mut() {
                Some(block) => {
                    block.text.push('\n');
                    block.text.push_str(line);
                    block.line_end = line_no;
                }
                None => {
                    current = Some(Block {
                        text: line.to_string(),
                        line_start: line_no,
                        line_end: line_no,
                        kind: BlockKind::Preamble,
                        symbol: None,
                    });
                }
            }
        }
    }
    if let Some(block) = current {
        blocks.push(block);
    }
    blocks
}

/// Plain-text strategy: paragraphs split on blank lines.
fn text_blocks(text: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut current: Option<Block> = None;

    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        if line.trim().is_empty() {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
            continue;
        }
        match current.as_mut() {
            Some(block) => {
                block.text.push('\n');
                block.text.push_str(line);
                block.line_end = line_no;
            }
            None => {
                current = Some(Block {
                    text: line.to_string(),
                    line_start: line_no,
                    line_end: line_no,
                    kind: BlockKind::Paragraph,
                    symbol: None,
                });
            }
        }
    }
    if let Some(block) = current {
        blocks.push(block);
    }
    blocks
}
