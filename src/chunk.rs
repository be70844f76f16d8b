//! Overlapping, size-bounded text chunker.
//!
//! Splits text into [`TextChunk`]s with one of three policies:
//!
//! - **token**: sliding window over tokenizer tokens (default).
//! - **sentence**: greedy packing of `.`/`!`/`?`-terminated sentences up to
//!   `chunk_size` characters.
//! - **character**: sliding window over Unicode scalar values. Used
//!   automatically when no tokenizer is available.
//!
//! Token windows are cut from the source text at token start offsets, never
//! decoded, so chunk text is always a verbatim slice of the input and line
//! spans are exact even for normalizing tokenizers.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{ChunkingConfig, SplitMethod};
use crate::models::TextChunk;

/// Tokenizes text into per-token source positions.
pub trait TokenCodec: Send + Sync {
    /// Byte offset in `text` where each token starts, in token order.
    fn token_starts(&self, text: &str) -> Result<Vec<usize>>;
}

impl TokenCodec for tokenizers::Tokenizer {
    fn token_starts(&self, text: &str) -> Result<Vec<usize>> {
        let encoding = self
            .encode(text, false)
            .map_err(|e| anyhow!("Tokenize: {}", e))?;
        Ok(encoding.get_offsets().iter().map(|&(start, _)| start).collect())
    }
}

pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    method: SplitMethod,
    codec: Option<Box<dyn TokenCodec>>,
}

impl TextSplitter {
    /// Create a splitter without a tokenizer. A `Token` method degrades to
    /// `Character` until [`with_codec`](Self::with_codec) supplies one.
    pub fn new(chunk_size: usize, chunk_overlap: usize, method: SplitMethod) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
            method,
            codec: None,
        }
    }

    pub fn with_codec(mut self, codec: Box<dyn TokenCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Build a splitter from configuration, loading the tokenizer when the
    /// token method is selected. Tokenizer failures are logged and the
    /// splitter falls back to character windows.
    pub fn from_config(config: &ChunkingConfig, cache_dir: &Path) -> Self {
        let splitter = Self::new(config.chunk_size, config.chunk_overlap, config.split_by);
        if config.split_by != SplitMethod::Token {
            return splitter;
        }

        match load_tokenizer(&config.tokenizer, cache_dir) {
            Ok(tokenizer) => splitter.with_codec(Box::new(tokenizer)),
            Err(e) => {
                tracing::warn!(
                    tokenizer = %config.tokenizer,
                    "failed to initialize tokenizer, falling back to character splitting: {:#}",
                    e
                );
                splitter
            }
        }
    }

    /// The method actually used by [`split`](Self::split).
    pub fn method(&self) -> SplitMethod {
        match (self.method, &self.codec) {
            (SplitMethod::Token, None) => SplitMethod::Character,
            (method, _) => method,
        }
    }

    fn stride(&self) -> usize {
        let overlap = self.chunk_overlap.min(self.chunk_size - 1);
        self.chunk_size - overlap
    }

    /// Split `text` originating from `file_path`, whose first line is `start_line`.
    pub fn split(&self, text: &str, file_path: &str, start_line: usize) -> Vec<TextChunk> {
        if text.is_empty() {
            return Vec::new();
        }

        match (self.method(), &self.codec) {
            (SplitMethod::Token, Some(codec)) => {
                match self.split_tokens(codec.as_ref(), text, file_path, start_line) {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        tracing::warn!(file = file_path, "token split failed, using characters: {:#}", e);
                        self.split_characters(text, file_path, start_line)
                    }
                }
            }
            (SplitMethod::Sentence, _) => self.split_sentences(text, file_path, start_line),
            _ => self.split_characters(text, file_path, start_line),
        }
    }

    fn split_tokens(
        &self,
        codec: &dyn TokenCodec,
        text: &str,
        file_path: &str,
        start_line: usize,
    ) -> Result<Vec<TextChunk>> {
        let starts = token_boundaries(text, codec.token_starts(text)?);
        if starts.is_empty() {
            return Ok(Vec::new());
        }

        let lines = LineIndex::new(text);
        let chunks = windows(starts.len(), self.chunk_size, self.stride())
            .enumerate()
            .map(|(seq, (first, last))| {
                let from = if first == 0 { 0 } else { starts[first] };
                let to = starts.get(last).copied().unwrap_or(text.len());
                let chunk_text = &text[from..to];
                let chunk_start = start_line + lines.newlines_before_byte(from);
                let chunk_end = chunk_start + chunk_text.matches('\n').count();
                TextChunk::new(
                    chunk_text.to_string(),
                    file_path,
                    chunk_start,
                    chunk_end,
                    seq,
                    SplitMethod::Token.as_str(),
                )
            })
            .collect();

        Ok(chunks)
    }

    fn split_characters(&self, text: &str, file_path: &str, start_line: usize) -> Vec<TextChunk> {
        let chars: Vec<char> = text.chars().collect();
        let lines = LineIndex::new(text);

        windows(chars.len(), self.chunk_size, self.stride())
            .enumerate()
            .map(|(seq, (start, end))| {
                let chunk_text: String = chars[start..end].iter().collect();
                let chunk_start = start_line + lines.newlines_before_char(start);
                let chunk_end = chunk_start + chunk_text.matches('\n').count();
                TextChunk::new(
                    chunk_text,
                    file_path,
                    chunk_start,
                    chunk_end,
                    seq,
                    SplitMethod::Character.as_str(),
                )
            })
            .collect()
    }

    fn split_sentences(&self, text: &str, file_path: &str, start_line: usize) -> Vec<TextChunk> {
        let lines = LineIndex::new(text);
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;
        let mut span = (0usize, 0usize);

        let flush = |current: &mut String, span: (usize, usize), chunks: &mut Vec<TextChunk>| {
            let seq = chunks.len();
            chunks.push(TextChunk::new(
                std::mem::take(current),
                file_path,
                start_line + lines.newlines_before_byte(span.0),
                start_line + lines.newlines_before_byte(span.1),
                seq,
                SplitMethod::Sentence.as_str(),
            ));
        };

        for (offset, sentence) in sentences(text) {
            let sentence_len = sentence.chars().count();

            if !current.is_empty() && current_len + 1 + sentence_len > self.chunk_size {
                flush(&mut current, span, &mut chunks);
                current_len = 0;
            }

            if current.is_empty() {
                span.0 = offset;
                current.push_str(sentence);
                current_len = sentence_len;
            } else {
                current.push(' ');
                current.push_str(sentence);
                current_len += 1 + sentence_len;
            }
            span.1 = offset + sentence.len();
        }

        if !current.is_empty() {
            flush(&mut current, span, &mut chunks);
        }

        chunks
    }
}

/// Sliding `[start, end)` windows over `len` units. The last window is the
/// first one that reaches `len`.
fn windows(len: usize, size: usize, stride: usize) -> impl Iterator<Item = (usize, usize)> {
    let mut start = 0usize;
    let mut done = len == 0;
    std::iter::from_fn(move || {
        if done {
            return None;
        }
        let end = (start + size).min(len);
        let window = (start, end);
        if end >= len {
            done = true;
        } else {
            start += stride;
        }
        Some(window)
    })
}

/// Token start offsets clamped to char boundaries and made non-decreasing.
/// Byte-level tokenizers may report offsets inside a multi-byte character.
fn token_boundaries(text: &str, starts: Vec<usize>) -> Vec<usize> {
    let mut floor = 0usize;
    starts
        .into_iter()
        .map(|start| {
            let mut at = start.clamp(floor, text.len());
            while !text.is_char_boundary(at) {
                at -= 1;
            }
            floor = at;
            at
        })
        .collect()
}

/// Trimmed, non-empty sentences with their byte offsets. A sentence ends
/// after a run of `.`, `!` or `?`.
fn sentences(text: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut iter = text.char_indices().peekable();

    while let Some((idx, c)) = iter.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let next_is_terminator = iter
            .peek()
            .map(|(_, n)| matches!(n, '.' | '!' | '?'))
            .unwrap_or(false);
        if next_is_terminator {
            continue;
        }
        let end = idx + c.len_utf8();
        push_sentence(text, start, end, &mut out);
        start = end;
    }
    push_sentence(text, start, text.len(), &mut out);

    out
}

fn push_sentence<'a>(text: &'a str, start: usize, end: usize, out: &mut Vec<(usize, &'a str)>) {
    let raw = &text[start..end];
    let trimmed = raw.trim_start();
    let offset = start + (raw.len() - trimmed.len());
    let trimmed = trimmed.trim_end();
    if !trimmed.is_empty() {
        out.push((offset, trimmed));
    }
}

/// Prefix newline counts by character and by byte position.
struct LineIndex<'a> {
    text: &'a str,
    /// `newlines[i]` = newlines among the first `i` characters.
    newlines: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    fn new(text: &'a str) -> Self {
        let mut newlines = Vec::with_capacity(text.len() + 1);
        let mut count = 0usize;
        newlines.push(0);
        for c in text.chars() {
            if c == '\n' {
                count += 1;
            }
            newlines.push(count);
        }
        Self { text, newlines }
    }

    fn char_len(&self) -> usize {
        self.newlines.len() - 1
    }

    fn newlines_before_char(&self, char_idx: usize) -> usize {
        self.newlines[char_idx.min(self.char_len())]
    }

    fn newlines_before_byte(&self, byte_idx: usize) -> usize {
        self.text[..byte_idx.min(self.text.len())].matches('\n').count()
    }
}

/// Load a HuggingFace tokenizer from a local `tokenizer.json` path or a hub
/// repository id. Hub files are downloaded once into `<cache_dir>/tokenizers/`.
pub fn load_tokenizer(source: &str, cache_dir: &Path) -> Result<tokenizers::Tokenizer> {
    let local = Path::new(source);
    let path = if local.is_file() {
        local.to_path_buf()
    } else {
        let cached = tokenizer_cache_path(source, cache_dir);
        download_to_cache(source, "tokenizer.json", &cached)?;
        cached
    };

    tokenizers::Tokenizer::from_file(&path)
        .map_err(|e| anyhow!("Load tokenizer {}: {}", path.display(), e))
}

fn tokenizer_cache_path(repo: &str, cache_dir: &Path) -> PathBuf {
    cache_dir
        .join("tokenizers")
        .join(repo.replace('/', "__"))
        .join("tokenizer.json")
}

fn download_to_cache(repo: &str, path: &str, cache_path: &Path) -> Result<()> {
    if cache_path.exists() {
        return Ok(());
    }
    let url = format!("https://huggingface.co/{}/resolve/main/{}", repo, path);
    tracing::info!(%url, "downloading tokenizer");
    let bytes = reqwest::blocking::get(&url)
        .and_then(|resp| resp.error_for_status())
        .and_then(|resp| resp.bytes())
        .with_context(|| format!("Download {}", url))?;
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Create tokenizer cache {}", parent.display()))?;
    }
    std::fs::write(cache_path, &bytes)
        .with_context(|| format!("Write tokenizer cache {}", cache_path.display()))?;
    Ok(())
}
