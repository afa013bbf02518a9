//! # Datasets
//!
//! Fixed length `(token_ids, type_ids, attention_mask)` examples built from
//! raw text corpora. Tokenization itself is delegated to a Hugging Face
//! `tokenizer.json`.
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tch::{Device, Tensor};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

/// One tokenized example, each field holds exactly `max_len` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub token_ids: Vec<i64>,
    pub type_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
}

pub trait TextDataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn item(&self, index: usize) -> anyhow::Result<Example>;
}

/// A batch of examples stacked into `(batch, max_len)` int64 tensors.
#[derive(Debug)]
pub struct Batch {
    pub token_ids: Tensor,
    pub type_ids: Tensor,
    pub attention_mask: Tensor,
}

impl Batch {
    pub fn collate(examples: &[Example], device: Device) -> anyhow::Result<Self> {
        let max_len = match examples.first() {
            None => anyhow::bail!("cannot collate an empty batch"),
            Some(e) => e.token_ids.len() as i64,
        };
        let stack = |f: fn(&Example) -> &[i64]| {
            let values: Vec<i64> = examples.iter().flat_map(|e| f(e).iter().copied()).collect();
            Tensor::from_slice(&values).view((-1, max_len)).to(device)
        };
        let uneven = |e: &Example| {
            [e.token_ids.len(), e.type_ids.len(), e.attention_mask.len()]
                .iter()
                .any(|&len| len as i64 != max_len)
        };
        if examples.iter().any(uneven) {
            anyhow::bail!("examples of different lengths in the same batch")
        }
        Ok(Self {
            token_ids: stack(|e| e.token_ids.as_slice()),
            type_ids: stack(|e| e.type_ids.as_slice()),
            attention_mask: stack(|e| e.attention_mask.as_slice()),
        })
    }

    pub fn size(&self) -> i64 {
        self.token_ids.size()[0]
    }
}

/// A tokenizer padding and truncating every text to `max_len` tokens.
#[derive(Clone)]
pub struct TextEncoder {
    tokenizer: Tokenizer,
    max_len: usize,
}

impl std::fmt::Debug for TextEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextEncoder").field("max_len", &self.max_len).finish()
    }
}

impl TextEncoder {
    pub fn new(mut tokenizer: Tokenizer, max_len: usize) -> anyhow::Result<Self> {
        let padding =
            PaddingParams { strategy: PaddingStrategy::Fixed(max_len), ..Default::default() };
        let truncation = TruncationParams { max_length: max_len, ..Default::default() };
        tokenizer.with_padding(Some(padding));
        tokenizer.with_truncation(Some(truncation)).map_err(anyhow::Error::msg)?;
        Ok(Self { tokenizer, max_len })
    }

    /// Loads a `tokenizer.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P, max_len: usize) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("error loading tokenizer {path:?}: {e}"))?;
        Self::new(tokenizer, max_len)
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn encode(&self, text: &str) -> anyhow::Result<Example> {
        let encoding = self.tokenizer.encode(text, true).map_err(anyhow::Error::msg)?;
        let widen = |vs: &[u32]| vs.iter().map(|&v| v as i64).collect::<Vec<_>>();
        Ok(Example {
            token_ids: widen(encoding.get_ids()),
            type_ids: widen(encoding.get_type_ids()),
            attention_mask: widen(encoding.get_attention_mask()),
        })
    }

    pub fn decode(&self, token_ids: &[i64], skip_special_tokens: bool) -> anyhow::Result<String> {
        let ids: Vec<u32> = token_ids.iter().map(|&v| v as u32).collect();
        self.tokenizer.decode(&ids, skip_special_tokens).map_err(anyhow::Error::msg)
    }
}

/// Reads the stories of a ROCStories CSV file, the sentences of a row are the
/// columns following the story id and title.
pub fn read_rocstories<R: Read>(reader: R) -> anyhow::Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::Fields)
        .from_reader(reader);
    let mut stories = vec![];
    for record in reader.records() {
        let record = record?;
        let sentences: Vec<&str> = record.iter().skip(2).filter(|s| !s.is_empty()).collect();
        stories.push(sentences.join(" "))
    }
    Ok(stories)
}

/// Reads an E2E NLG file, one example per line with the text after the last
/// `||` separator.
pub fn read_e2e<R: Read>(reader: R) -> anyhow::Result<Vec<String>> {
    let mut texts = vec![];
    for line in BufReader::new(reader).lines() {
        let line = line?;
        match line.rsplit("||").next() {
            Some(text) if !text.trim().is_empty() => texts.push(text.trim().to_string()),
            _ => {}
        }
    }
    Ok(texts)
}

/// A dataset of raw texts tokenized on access.
#[derive(Debug, Clone)]
pub struct TextCorpus {
    texts: Vec<String>,
    encoder: TextEncoder,
}

impl TextCorpus {
    pub fn new(texts: Vec<String>, encoder: TextEncoder) -> Self {
        Self { texts, encoder }
    }

    /// The ROCStories short story corpus.
    pub fn rocstories<P: AsRef<Path>>(path: P, encoder: TextEncoder) -> anyhow::Result<Self> {
        let texts = read_rocstories(crate::utils::file_open(path)?)?;
        Ok(Self::new(texts, encoder))
    }

    /// The E2E restaurant descriptions corpus.
    pub fn e2e<P: AsRef<Path>>(path: P, encoder: TextEncoder) -> anyhow::Result<Self> {
        let texts = read_e2e(crate::utils::file_open(path)?)?;
        Ok(Self::new(texts, encoder))
    }

    pub fn encoder(&self) -> &TextEncoder {
        &self.encoder
    }
}

impl TextDataset for TextCorpus {
    fn len(&self) -> usize {
        self.texts.len()
    }

    fn item(&self, index: usize) -> anyhow::Result<Example> {
        match self.texts.get(index) {
            None => anyhow::bail!("index {index} out of range for {} examples", self.texts.len()),
            Some(text) => self.encoder.encode(text),
        }
    }
}
