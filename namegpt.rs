// namegpt.rs
// A character-level GPT that learns short names and dreams up new ones.
// Scalar autograd arena, incremental KV attention, Adam with linear decay.
// One seeded generator rules them all: same seed, same names.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const FORMAT_VERSION: u32 = 1;
const RMS_EPS: f64 = 1e-5;
const STEP_OPTIONS: [usize; 4] = [50, 100, 500, 1000];

// ============================================================
// 0) ERRORS
// ============================================================

#[derive(Debug)]
enum GptError {
    Config { field: &'static str, reason: String },
    Argument { name: &'static str, reason: String },
    /// `row == None` means the row count is wrong, otherwise the width of that row.
    Shape { matrix: String, row: Option<usize>, expected: usize, got: usize },
    MissingMatrix(String),
    Checkpoint(String),
    NotFound(PathBuf),
    UnknownChar(char),
    EmptyCorpus { pattern: &'static str },
    Numerical(String),
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for GptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { field, reason } => write!(f, "invalid config: {field} {reason}"),
            Self::Argument { name, reason } => write!(f, "invalid argument: {name} {reason}"),
            Self::Shape { matrix, row: None, expected, got } => {
                write!(f, "expected len({matrix}) == {expected}, got {got}")
            }
            Self::Shape { matrix, row: Some(r), expected, got } => {
                write!(f, "expected len({matrix}[{r}]) == {expected}, got {got}")
            }
            Self::MissingMatrix(name) => write!(f, "state dict matrix '{name}' is missing"),
            Self::Checkpoint(reason) => write!(f, "invalid checkpoint: {reason}"),
            Self::NotFound(path) => write!(f, "required file not found: {}", path.display()),
            Self::UnknownChar(c) => write!(f, "character {c:?} (U+{:04X}) is not in the vocabulary", *c as u32),
            Self::EmptyCorpus { pattern } => {
                write!(f, "no valid names found after filtering with {pattern}")
            }
            Self::Numerical(what) => write!(f, "numerical failure: {what}"),
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Json(e) => write!(f, "json: {e}"),
        }
    }
}

impl std::error::Error for GptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for GptError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<serde_json::Error> for GptError {
    fn from(e: serde_json::Error) -> Self { Self::Json(e) }
}

type GptResult<T> = Result<T, GptError>;

// ============================================================
// 1) CONFIG
// ============================================================

/// Model shape. Immutable once a model is built from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ModelConfig {
    n_layer: usize,
    n_embd: usize,
    block_size: usize,
    n_head: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig { n_layer: 1, n_embd: 16, block_size: 16, n_head: 4 }
    }
}

impl ModelConfig {
    fn validate(&self) -> GptResult<()> {
        let positive = [
            ("n_layer", self.n_layer),
            ("n_embd", self.n_embd),
            ("block_size", self.block_size),
            ("n_head", self.n_head),
        ];
        for (field, v) in positive {
            if v == 0 {
                return Err(GptError::Config { field, reason: "must be > 0".into() });
            }
        }
        if self.n_embd % self.n_head != 0 {
            return Err(GptError::Config {
                field: "n_embd",
                reason: format!("({}) is not divisible by n_head ({})", self.n_embd, self.n_head),
            });
        }
        Ok(())
    }

    fn head_dim(&self) -> usize { self.n_embd / self.n_head }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
enum Charset {
    /// Lowercase ASCII names, `^[a-z]+$`.
    #[default]
    Latin,
    /// Precomposed Hangul syllables, trained as conjoining jamo.
    Hangul,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
struct Settings {
    data_path: PathBuf,
    charset: Charset,
    checkpoint_path: PathBuf,
    trace_path: PathBuf,
    snapshot_path: PathBuf,
    seed: u64,
    model: ModelConfig,
    init_std: f64,
    num_steps: usize,
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps_adam: f64,
    temperature: f64,
    num_samples: usize,
    max_tokens: Option<usize>,
    /// Decimal places in the training trace; unset means the charset's default.
    round_digits: Option<u32>,
    log_every: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_path: "data/en_name.txt".into(),
            charset: Charset::Latin,
            checkpoint_path: "checkpoints/en_model.json".into(),
            trace_path: "data/en_training_trace.json".into(),
            snapshot_path: "data/en_embedding_snapshot.json".into(),
            seed: 42,
            model: ModelConfig::default(),
            init_std: 0.08,
            num_steps: 1000,
            learning_rate: 0.003,
            beta1: 0.85,
            beta2: 0.99,
            eps_adam: 1e-8,
            temperature: 0.5,
            num_samples: 20,
            max_tokens: None,
            round_digits: None,
            log_every: 100,
        }
    }
}

impl Settings {
    fn load(path: Option<&Path>) -> GptResult<Settings> {
        let Some(path) = path else { return Ok(Settings::default()) };
        if !path.exists() {
            return Err(GptError::NotFound(path.to_path_buf()));
        }
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    fn train_config(&self) -> TrainConfig {
        TrainConfig {
            num_steps: self.num_steps,
            learning_rate: self.learning_rate,
            adam: AdamConfig { beta1: self.beta1, beta2: self.beta2, eps: self.eps_adam },
            log_every: self.log_every,
        }
    }

    fn trace_digits(&self) -> u32 { self.round_digits.unwrap_or(self.charset.round_digits()) }

    fn sample_config(&self) -> SampleConfig {
        SampleConfig {
            num_samples: self.num_samples,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

// ============================================================
// 2) AUTOGRAD ARENA: scalar nodes, index-linked
// ============================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NodeId(usize);

/// Right-hand side of a binary op: another node, or a plain constant that
/// takes no gradient.
#[derive(Clone, Copy, Debug)]
enum Operand {
    Node(NodeId),
    Const(f64),
}

impl From<NodeId> for Operand {
    fn from(id: NodeId) -> Self { Operand::Node(id) }
}

impl From<f64> for Operand {
    fn from(c: f64) -> Self { Operand::Const(c) }
}

#[derive(Clone, Copy, Debug)]
struct Node {
    value: f64,
    grad: f64,
    arity: u8,
    preds: [NodeId; 2],
    local: [f64; 2],
}

impl Node {
    fn predecessors(&self) -> &[NodeId] { &self.preds[..self.arity as usize] }
    fn local_derivatives(&self) -> &[f64] { &self.local[..self.arity as usize] }
}

/// One forward/backward pass worth of nodes. Dropped after the optimizer step.
struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    #[cfg(test)]
    fn new() -> Self { Graph { nodes: Vec::with_capacity(4096) } }

    /// Fresh arena whose first `model.num_params()` nodes are the model's
    /// parameters, in flattening order.
    fn for_model(model: &Model) -> Self {
        let mut g = Graph { nodes: Vec::with_capacity(model.num_params() + 4096) };
        for mat in &model.mats {
            for row in &mat.data {
                for &v in row {
                    g.leaf(v);
                }
            }
        }
        g
    }

    fn push(&mut self, value: f64, edges: &[(NodeId, f64)]) -> NodeId {
        debug_assert!(edges.len() <= 2);
        let mut node = Node { value, grad: 0.0, arity: edges.len() as u8, preds: [NodeId(0); 2], local: [0.0; 2] };
        for (k, &(p, d)) in edges.iter().enumerate() {
            node.preds[k] = p;
            node.local[k] = d;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    fn leaf(&mut self, value: f64) -> NodeId { self.push(value, &[]) }

    fn value(&self, id: NodeId) -> f64 { self.nodes[id.0].value }

    fn grad(&self, id: NodeId) -> f64 { self.nodes[id.0].grad }

    fn len(&self) -> usize { self.nodes.len() }

    fn add(&mut self, a: NodeId, b: impl Into<Operand>) -> NodeId {
        let av = self.value(a);
        match b.into() {
            Operand::Node(b) => {
                let bv = self.value(b);
                self.push(av + bv, &[(a, 1.0), (b, 1.0)])
            }
            Operand::Const(c) => self.push(av + c, &[(a, 1.0)]),
        }
    }

    fn mul(&mut self, a: NodeId, b: impl Into<Operand>) -> NodeId {
        let av = self.value(a);
        match b.into() {
            Operand::Node(b) => {
                let bv = self.value(b);
                self.push(av * bv, &[(a, bv), (b, av)])
            }
            Operand::Const(c) => self.push(av * c, &[(a, c)]),
        }
    }

    fn pow(&mut self, a: NodeId, exponent: f64) -> NodeId {
        let av = self.value(a);
        self.push(av.powf(exponent), &[(a, exponent * av.powf(exponent - 1.0))])
    }

    /// ln of a non-positive value yields NaN/-inf; callers surface that.
    fn log(&mut self, a: NodeId) -> NodeId {
        let av = self.value(a);
        self.push(av.ln(), &[(a, 1.0 / av)])
    }

    fn exp(&mut self, a: NodeId) -> NodeId {
        let e = self.value(a).exp();
        self.push(e, &[(a, e)])
    }

    fn relu(&mut self, a: NodeId) -> NodeId {
        let av = self.value(a);
        self.push(av.max(0.0), &[(a, if av > 0.0 { 1.0 } else { 0.0 })])
    }

    fn neg(&mut self, a: NodeId) -> NodeId { self.mul(a, -1.0) }

    fn sub(&mut self, a: NodeId, b: impl Into<Operand>) -> NodeId {
        match b.into() {
            Operand::Node(b) => {
                let nb = self.neg(b);
                self.add(a, nb)
            }
            Operand::Const(c) => self.add(a, -c),
        }
    }

    fn div(&mut self, a: NodeId, b: impl Into<Operand>) -> NodeId {
        match b.into() {
            Operand::Node(b) => {
                let inv = self.pow(b, -1.0);
                self.mul(a, inv)
            }
            Operand::Const(c) => self.mul(a, 1.0 / c),
        }
    }

    fn sum(&mut self, terms: &[NodeId]) -> NodeId {
        let Some((&first, rest)) = terms.split_first() else { return self.leaf(0.0) };
        rest.iter().fold(first, |acc, &t| self.add(acc, t))
    }

    fn dot(&mut self, a: &[NodeId], b: &[NodeId]) -> NodeId {
        debug_assert_eq!(a.len(), b.len());
        let terms: Vec<NodeId> = a.iter().zip(b).map(|(&x, &y)| self.mul(x, y)).collect();
        self.sum(&terms)
    }

    // ---- BACKWARD ----

    /// Every node reachable from `root`, each once, predecessors first.
    /// Iterative postorder so long sequences cannot blow the call stack.
    fn topo_order(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if visited[id.0] {
                continue;
            }
            visited[id.0] = true;
            stack.push((id, true));
            for &p in self.nodes[id.0].predecessors().iter().rev() {
                if !visited[p.0] {
                    stack.push((p, false));
                }
            }
        }
        order
    }

    fn backward(&mut self, root: NodeId) {
        let order = self.topo_order(root);
        self.nodes[root.0].grad = 1.0;
        for &id in order.iter().rev() {
            let node = self.nodes[id.0];
            for (&p, &d) in node.predecessors().iter().zip(node.local_derivatives()) {
                self.nodes[p.0].grad += d * node.grad;
            }
        }
    }
}

// ============================================================
// 3) LINEAR ALGEBRA ON THE GRAPH
// ============================================================

fn linear(g: &mut Graph, x: &[NodeId], w: &MatrixParam) -> Vec<NodeId> {
    debug_assert_eq!(x.len(), w.nin);
    (0..w.nout)
        .map(|r| {
            let terms: Vec<NodeId> = x.iter().enumerate().map(|(c, &xi)| g.mul(w.node(r, c), xi)).collect();
            g.sum(&terms)
        })
        .collect()
}

fn softmax(g: &mut Graph, logits: &[NodeId]) -> Vec<NodeId> {
    let max_val = logits.iter().map(|&l| g.value(l)).fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<NodeId> = logits
        .iter()
        .map(|&l| {
            let shifted = g.sub(l, max_val);
            g.exp(shifted)
        })
        .collect();
    let total = g.sum(&exps);
    let inv_total = g.pow(total, -1.0);
    exps.iter().map(|&e| g.mul(e, inv_total)).collect()
}

fn rmsnorm(g: &mut Graph, x: &[NodeId]) -> Vec<NodeId> {
    let squares: Vec<NodeId> = x.iter().map(|&xi| g.mul(xi, xi)).collect();
    let total = g.sum(&squares);
    let ms = g.div(total, x.len() as f64);
    let shifted = g.add(ms, RMS_EPS);
    let scale = g.pow(shifted, -0.5);
    x.iter().map(|&xi| g.mul(xi, scale)).collect()
}

fn residual_add(g: &mut Graph, x: &[NodeId], residual: &[NodeId]) -> Vec<NodeId> {
    x.iter().zip(residual).map(|(&a, &b)| g.add(a, b)).collect()
}

// ============================================================
// 4) CORPUS + TOKENIZER
// ============================================================

const S_BASE: u32 = 0xAC00;
const L_BASE: u32 = 0x1100;
const V_BASE: u32 = 0x1161;
const T_BASE: u32 = 0x11A7;
const L_COUNT: u32 = 19;
const V_COUNT: u32 = 21;
const T_COUNT: u32 = 28;
const S_COUNT: u32 = L_COUNT * V_COUNT * T_COUNT;

// Leading consonants U+1100..U+1112: romanized name, compatibility jamo.
const CHOSEONG: [(&str, char); 19] = [
    ("giyeok", 'ㄱ'), ("ssanggiyeok", 'ㄲ'), ("nieun", 'ㄴ'), ("digeut", 'ㄷ'),
    ("ssangdigeut", 'ㄸ'), ("rieul", 'ㄹ'), ("mieum", 'ㅁ'), ("bieup", 'ㅂ'),
    ("ssangbieup", 'ㅃ'), ("sios", 'ㅅ'), ("ssangsios", 'ㅆ'), ("ieung", 'ㅇ'),
    ("jieut", 'ㅈ'), ("ssangjieut", 'ㅉ'), ("chieut", 'ㅊ'), ("kieuk", 'ㅋ'),
    ("tieut", 'ㅌ'), ("pieup", 'ㅍ'), ("hieuh", 'ㅎ'),
];

fn is_syllable(c: char) -> bool { (S_BASE..S_BASE + S_COUNT).contains(&(c as u32)) }

fn choseong(c: char) -> Option<(&'static str, char)> {
    let cp = c as u32;
    (L_BASE..L_BASE + L_COUNT).contains(&cp).then(|| CHOSEONG[(cp - L_BASE) as usize])
}

impl Charset {
    fn pattern(self) -> &'static str {
        match self {
            Charset::Latin => "^[a-z]+$",
            Charset::Hangul => "^[가-힣]+$",
        }
    }

    /// Surface form of a raw corpus line, or None if the line is filtered out.
    fn accept(self, line: &str) -> Option<String> {
        let name = match self {
            Charset::Latin => line.trim().to_lowercase(),
            Charset::Hangul => line.trim().to_string(),
        };
        let ok = !name.is_empty()
            && match self {
                Charset::Latin => name.chars().all(|c| c.is_ascii_lowercase()),
                Charset::Hangul => name.chars().all(is_syllable),
            };
        ok.then_some(name)
    }

    /// Training form: Hangul syllables split into conjoining jamo.
    fn decompose(self, name: &str) -> String {
        if self == Charset::Latin {
            return name.to_string();
        }
        let mut out = String::with_capacity(name.len() * 3);
        for c in name.chars() {
            if !is_syllable(c) {
                out.push(c);
                continue;
            }
            let s = c as u32 - S_BASE;
            let jamo = [
                Some(L_BASE + s / (V_COUNT * T_COUNT)),
                Some(V_BASE + (s % (V_COUNT * T_COUNT)) / T_COUNT),
                (s % T_COUNT != 0).then(|| T_BASE + s % T_COUNT),
            ];
            out.extend(jamo.into_iter().flatten().filter_map(char::from_u32));
        }
        out
    }

    /// Display form: leading+vowel(+trailing) runs recombined into syllables.
    fn compose(self, text: &str) -> String {
        if self == Charset::Latin {
            return text.to_string();
        }
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::with_capacity(text.len());
        let mut i = 0;
        while i < chars.len() {
            let l = chars[i] as u32;
            let v = chars.get(i + 1).map(|&c| c as u32);
            if let Some(v) = v.filter(|v| (L_BASE..L_BASE + L_COUNT).contains(&l) && (V_BASE..V_BASE + V_COUNT).contains(v)) {
                let mut s = S_BASE + ((l - L_BASE) * V_COUNT + (v - V_BASE)) * T_COUNT;
                i += 2;
                if let Some(t) = chars.get(i).map(|&c| c as u32).filter(|&t| t > T_BASE && t < T_BASE + T_COUNT) {
                    s += t - T_BASE;
                    i += 1;
                }
                out.extend(char::from_u32(s));
                continue;
            }
            out.push(chars[i]);
            i += 1;
        }
        out
    }

    fn round_digits(self) -> u32 {
        match self {
            Charset::Latin => 4,
            Charset::Hangul => 8,
        }
    }

    /// Rows the training trace follows by default.
    fn trace_preferences(self) -> [char; 2] {
        match self {
            Charset::Latin => ['a', 'e'],
            Charset::Hangul => ['\u{110B}', '\u{1109}'],
        }
    }

    fn slug(self, c: char) -> String {
        match (self, choseong(c)) {
            (Charset::Latin, _) => format!("letter_{c}"),
            (Charset::Hangul, Some((name, _))) => format!("choseong_{name}"),
            (Charset::Hangul, None) => format!("u{:04x}", c as u32),
        }
    }

    fn display(self, c: char) -> char {
        choseong(c).map_or(c, |(_, compat)| compat)
    }

    fn describe(self, c: char) -> String {
        match (self, choseong(c)) {
            (Charset::Latin, _) => format!("Letter {c}"),
            (Charset::Hangul, Some((_, compat))) => format!("초성 {compat}"),
            (Charset::Hangul, None) => c.to_string(),
        }
    }
}

#[derive(Debug)]
struct Corpus {
    /// Shuffled training strings.
    docs: Vec<String>,
    /// Surface forms, for membership checks on samples.
    names: BTreeSet<String>,
}

impl Corpus {
    fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>, charset: Charset, rng: &mut StdRng) -> GptResult<Corpus> {
        let raw: Vec<&str> = lines.into_iter().filter(|l| !l.trim().is_empty()).collect();
        let accepted: Vec<String> = raw.iter().filter_map(|l| charset.accept(l)).collect();
        info!(
            "[init] raw docs: {}, filtered docs: {}, dropped: {}",
            raw.len(),
            accepted.len(),
            raw.len() - accepted.len()
        );
        if accepted.is_empty() {
            return Err(GptError::EmptyCorpus { pattern: charset.pattern() });
        }
        let mut docs: Vec<String> = accepted.iter().map(|n| charset.decompose(n)).collect();
        docs.shuffle(rng);
        info!("[init] num docs: {}", docs.len());
        Ok(Corpus { docs, names: accepted.into_iter().collect() })
    }
}

fn load_corpus(path: &Path, charset: Charset, rng: &mut StdRng) -> GptResult<Corpus> {
    if !path.exists() {
        return Err(GptError::NotFound(path.to_path_buf()));
    }
    let content = fs::read_to_string(path)?;
    Corpus::from_lines(content.lines(), charset, rng)
}

/// Character vocabulary. The id one past the alphabet is the terminator,
/// used both to start and to end a sequence.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Tokenizer {
    uchars: Vec<char>,
    bos: usize,
    vocab_size: usize,
    #[serde(skip)]
    stoi: HashMap<char, usize>,
}

impl Tokenizer {
    fn from_docs(docs: &[String]) -> Self {
        let uchars: Vec<char> = docs.iter().flat_map(|d| d.chars()).collect::<BTreeSet<_>>().into_iter().collect();
        let bos = uchars.len();
        let mut tok = Tokenizer { uchars, bos, vocab_size: bos + 1, stoi: HashMap::new() };
        tok.rebuild_index();
        tok
    }

    fn rebuild_index(&mut self) {
        self.stoi = self.uchars.iter().enumerate().map(|(i, &c)| (c, i)).collect();
    }

    fn validate(&self) -> GptResult<()> {
        if self.bos != self.uchars.len() || self.vocab_size != self.bos + 1 {
            return Err(GptError::Checkpoint(format!(
                "tokenizer has {} chars, BOS {} and vocab size {}",
                self.uchars.len(),
                self.bos,
                self.vocab_size
            )));
        }
        let unique: BTreeSet<char> = self.uchars.iter().copied().collect();
        if unique.len() != self.uchars.len() {
            return Err(GptError::Checkpoint("tokenizer alphabet has duplicate characters".into()));
        }
        Ok(())
    }

    fn id_of(&self, c: char) -> Option<usize> { self.stoi.get(&c).copied() }

    /// `[bos] + chars + [bos]`.
    fn encode(&self, doc: &str) -> GptResult<Vec<usize>> {
        let mut ids = Vec::with_capacity(doc.len() + 2);
        ids.push(self.bos);
        for c in doc.chars() {
            ids.push(self.id_of(c).ok_or(GptError::UnknownChar(c))?);
        }
        ids.push(self.bos);
        Ok(ids)
    }

    /// None for the terminator.
    fn decode(&self, id: usize) -> Option<char> { self.uchars.get(id).copied() }
}

// ============================================================
// 5) MATRIX PARAM + GPT MODEL
// ============================================================

/// Persistent parameter block. Values survive across steps; `grad` is filled
/// from each step's graph and cleared by the optimizer.
#[derive(Clone, Debug)]
struct MatrixParam {
    name: String,
    data: Vec<Vec<f64>>,
    grad: Vec<Vec<f64>>,
    nout: usize,
    nin: usize,
    /// Position of element (0, 0) in the flattened parameter list.
    offset: usize,
}

impl MatrixParam {
    fn from_rows(name: String, data: Vec<Vec<f64>>, nout: usize, nin: usize, offset: usize) -> GptResult<Self> {
        if data.len() != nout {
            return Err(GptError::Shape { matrix: name, row: None, expected: nout, got: data.len() });
        }
        if let Some((r, row)) = data.iter().enumerate().find(|(_, row)| row.len() != nin) {
            return Err(GptError::Shape { matrix: name, row: Some(r), expected: nin, got: row.len() });
        }
        Ok(MatrixParam { name, data, grad: vec![vec![0.0; nin]; nout], nout, nin, offset })
    }

    fn node(&self, r: usize, c: usize) -> NodeId { NodeId(self.offset + r * self.nin + c) }

    fn numel(&self) -> usize { self.nout * self.nin }

    fn zero_grad(&mut self) {
        for row in self.grad.iter_mut() {
            row.iter_mut().for_each(|v| *v = 0.0);
        }
    }
}

const WTE: usize = 0;
const WPE: usize = 1;
const LM_HEAD: usize = 2;
const LAYER_BASE: usize = 3;
const PER_LAYER: usize = 6;

#[derive(Clone, Copy)]
enum LayerMat {
    AttnWq = 0,
    AttnWk = 1,
    AttnWv = 2,
    AttnWo = 3,
    MlpFc1 = 4,
    MlpFc2 = 5,
}

/// Name and shape of every parameter matrix, in flattening order.
fn matrix_layout(cfg: &ModelConfig, vocab_size: usize) -> Vec<(String, usize, usize)> {
    let ne = cfg.n_embd;
    let mut layout = vec![
        ("wte".to_string(), vocab_size, ne),
        ("wpe".to_string(), cfg.block_size, ne),
        ("lm_head".to_string(), vocab_size, ne),
    ];
    for li in 0..cfg.n_layer {
        let p = format!("layer{li}");
        layout.push((format!("{p}.attn_wq"), ne, ne));
        layout.push((format!("{p}.attn_wk"), ne, ne));
        layout.push((format!("{p}.attn_wv"), ne, ne));
        layout.push((format!("{p}.attn_wo"), ne, ne));
        layout.push((format!("{p}.mlp_fc1"), 4 * ne, ne));
        layout.push((format!("{p}.mlp_fc2"), ne, 4 * ne));
    }
    layout
}

/// Per-layer append-only key/value history for the sequence in progress.
struct KvCache {
    keys: Vec<Vec<Vec<NodeId>>>,
    values: Vec<Vec<Vec<NodeId>>>,
}

impl KvCache {
    fn new(n_layer: usize) -> Self {
        KvCache { keys: vec![Vec::new(); n_layer], values: vec![Vec::new(); n_layer] }
    }

    fn positions(&self) -> usize { self.keys.first().map_or(0, Vec::len) }
}

struct Model {
    cfg: ModelConfig,
    vocab_size: usize,
    mats: Vec<MatrixParam>,
}

impl Model {
    fn build(
        cfg: ModelConfig,
        vocab_size: usize,
        mut fill: impl FnMut(&str, usize, usize) -> GptResult<Vec<Vec<f64>>>,
    ) -> GptResult<Model> {
        cfg.validate()?;
        if vocab_size < 2 {
            return Err(GptError::Config { field: "vocab_size", reason: format!("({vocab_size}) must be >= 2") });
        }
        let mut mats = Vec::new();
        let mut offset = 0;
        for (name, nout, nin) in matrix_layout(&cfg, vocab_size) {
            let data = fill(&name, nout, nin)?;
            let mat = MatrixParam::from_rows(name, data, nout, nin, offset)?;
            offset += mat.numel();
            mats.push(mat);
        }
        Ok(Model { cfg, vocab_size, mats })
    }

    /// Gaussian init, drawn row by row in layout order from `rng`.
    fn new(cfg: ModelConfig, vocab_size: usize, std: f64, rng: &mut StdRng) -> GptResult<Model> {
        let dist = Normal::new(0.0, std).map_err(|e| GptError::Config { field: "init_std", reason: e.to_string() })?;
        let model = Model::build(cfg, vocab_size, |_, nout, nin| {
            Ok((0..nout).map(|_| (0..nin).map(|_| dist.sample(rng)).collect()).collect())
        })?;
        debug!("[init] model with {} params in {} matrices", model.num_params(), model.mats.len());
        Ok(model)
    }

    fn from_state_dict(cfg: ModelConfig, vocab_size: usize, state: &BTreeMap<String, Vec<Vec<f64>>>) -> GptResult<Model> {
        Model::build(cfg, vocab_size, |name, _, _| {
            state.get(name).cloned().ok_or_else(|| GptError::MissingMatrix(name.to_string()))
        })
    }

    fn state_dict(&self) -> BTreeMap<String, Vec<Vec<f64>>> {
        self.mats.iter().map(|m| (m.name.clone(), m.data.clone())).collect()
    }

    fn num_params(&self) -> usize { self.mats.iter().map(MatrixParam::numel).sum() }

    fn mat(&self, index: usize) -> &MatrixParam { &self.mats[index] }

    fn layer_mat(&self, li: usize, which: LayerMat) -> &MatrixParam {
        &self.mats[LAYER_BASE + li * PER_LAYER + which as usize]
    }

    fn matrix_index(&self, name: &str) -> Option<usize> { self.mats.iter().position(|m| m.name == name) }

    /// Adds the parameter-leaf gradients of `g` into each matrix's `grad`.
    fn accumulate_grads(&mut self, g: &Graph) {
        for mat in &mut self.mats {
            for r in 0..mat.nout {
                for c in 0..mat.nin {
                    let id = mat.node(r, c);
                    mat.grad[r][c] += g.grad(id);
                }
            }
        }
    }

    fn zero_grads(&mut self) {
        self.mats.iter_mut().for_each(MatrixParam::zero_grad);
    }

    /// Logits for one token at one position. Appends this position's keys and
    /// values to `cache`; attention sees exactly what the cache holds.
    fn forward(&self, g: &mut Graph, token_id: usize, pos_id: usize, cache: &mut KvCache) -> Vec<NodeId> {
        let ne = self.cfg.n_embd;
        let hd = self.cfg.head_dim();
        let attn_scale = (hd as f64).sqrt();
        debug_assert!(token_id < self.vocab_size && pos_id < self.cfg.block_size);
        debug_assert_eq!(cache.positions(), pos_id);

        let (wte, wpe) = (self.mat(WTE), self.mat(WPE));
        let x: Vec<NodeId> = (0..ne).map(|j| g.add(wte.node(token_id, j), wpe.node(pos_id, j))).collect();
        let mut x = rmsnorm(g, &x);

        for li in 0..self.cfg.n_layer {
            // 1) multi-head attention
            let x_residual = x.clone();
            x = rmsnorm(g, &x);
            let q = linear(g, &x, self.layer_mat(li, LayerMat::AttnWq));
            let k = linear(g, &x, self.layer_mat(li, LayerMat::AttnWk));
            let v = linear(g, &x, self.layer_mat(li, LayerMat::AttnWv));
            cache.keys[li].push(k);
            cache.values[li].push(v);

            let mut x_attn = Vec::with_capacity(ne);
            for h in 0..self.cfg.n_head {
                let hs = h * hd;
                let q_h = &q[hs..hs + hd];
                let attn_logits: Vec<NodeId> = cache.keys[li]
                    .iter()
                    .map(|k_t| {
                        let d = g.dot(q_h, &k_t[hs..hs + hd]);
                        g.div(d, attn_scale)
                    })
                    .collect();
                let attn_weights = softmax(g, &attn_logits);
                for j in 0..hd {
                    let terms: Vec<NodeId> = attn_weights
                        .iter()
                        .zip(&cache.values[li])
                        .map(|(&w, v_t)| g.mul(w, v_t[hs + j]))
                        .collect();
                    x_attn.push(g.sum(&terms));
                }
            }
            let proj = linear(g, &x_attn, self.layer_mat(li, LayerMat::AttnWo));
            x = residual_add(g, &proj, &x_residual);

            // 2) MLP
            let x_residual = x.clone();
            x = rmsnorm(g, &x);
            x = linear(g, &x, self.layer_mat(li, LayerMat::MlpFc1));
            x = x.iter().map(|&xi| g.relu(xi)).collect();
            x = linear(g, &x, self.layer_mat(li, LayerMat::MlpFc2));
            x = residual_add(g, &x, &x_residual);
        }

        linear(g, &x, self.mat(LM_HEAD))
    }
}

// ============================================================
// 6) TRAINING: Adam, linear LR decay
// ============================================================

#[derive(Clone, Copy, Debug)]
struct AdamConfig {
    beta1: f64,
    beta2: f64,
    eps: f64,
}

#[derive(Clone, Copy, Debug)]
struct TrainConfig {
    num_steps: usize,
    learning_rate: f64,
    adam: AdamConfig,
    log_every: usize,
}

impl TrainConfig {
    fn validate(&self) -> GptResult<()> {
        if self.num_steps == 0 {
            return Err(GptError::Config { field: "num_steps", reason: "must be > 0".into() });
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(GptError::Config { field: "learning_rate", reason: format!("({}) must be > 0", self.learning_rate) });
        }
        for (field, beta) in [("beta1", self.adam.beta1), ("beta2", self.adam.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(GptError::Config { field, reason: format!("({beta}) must be in [0, 1)") });
            }
        }
        if !(self.adam.eps > 0.0) {
            return Err(GptError::Config { field: "eps_adam", reason: "must be > 0".into() });
        }
        Ok(())
    }
}

/// Moments and step counter, as stored in a checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct OptimizerSnapshot {
    step: usize,
    m: Vec<f64>,
    v: Vec<f64>,
}

struct Adam {
    cfg: AdamConfig,
    m: Vec<f64>,
    v: Vec<f64>,
    /// Updates applied so far; the next update uses bias correction `t + 1`.
    t: usize,
}

impl Adam {
    fn new(num_params: usize, cfg: AdamConfig) -> Self {
        Adam { cfg, m: vec![0.0; num_params], v: vec![0.0; num_params], t: 0 }
    }

    fn restore(cfg: AdamConfig, snap: OptimizerSnapshot, num_params: usize) -> GptResult<Self> {
        if snap.m.len() != num_params || snap.v.len() != num_params {
            return Err(GptError::Checkpoint(format!(
                "optimizer moments cover {}/{} params, model has {}",
                snap.m.len(),
                snap.v.len(),
                num_params
            )));
        }
        Ok(Adam { cfg, m: snap.m, v: snap.v, t: snap.step })
    }

    fn snapshot(&self) -> OptimizerSnapshot {
        OptimizerSnapshot { step: self.t, m: self.m.clone(), v: self.v.clone() }
    }

    /// One bias-corrected update over every parameter, then zero all grads.
    fn step(&mut self, model: &mut Model, lr: f64) {
        let AdamConfig { beta1, beta2, eps } = self.cfg;
        self.t += 1;
        let b1c = 1.0 - beta1.powi(self.t as i32);
        let b2c = 1.0 - beta2.powi(self.t as i32);
        let mut k = 0;
        for mat in model.mats.iter_mut() {
            for (data_row, grad_row) in mat.data.iter_mut().zip(&mat.grad) {
                for (p, g) in data_row.iter_mut().zip(grad_row.iter()) {
                    self.m[k] = beta1 * self.m[k] + (1.0 - beta1) * *g;
                    self.v[k] = beta2 * self.v[k] + (1.0 - beta2) * *g * *g;
                    let m_hat = self.m[k] / b1c;
                    let v_hat = self.v[k] / b2c;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                    k += 1;
                }
            }
        }
        model.zero_grads();
    }
}

/// `step` is the 0-based index of the update about to run.
fn linear_decay_lr(base_lr: f64, step: usize, num_steps: usize) -> f64 {
    base_lr * (1.0 - step as f64 / num_steps as f64)
}

/// Mean negative log-likelihood of every next-token transition in `tokens`,
/// truncated to the model's context length.
fn sequence_loss(g: &mut Graph, model: &Model, tokens: &[usize]) -> GptResult<NodeId> {
    let n = model.cfg.block_size.min(tokens.len().saturating_sub(1));
    if n == 0 {
        return Err(GptError::Argument { name: "tokens", reason: "need at least one transition".into() });
    }
    let mut cache = KvCache::new(model.cfg.n_layer);
    let mut losses = Vec::with_capacity(n);
    for pos_id in 0..n {
        let (token_id, target_id) = (tokens[pos_id], tokens[pos_id + 1]);
        let logits = model.forward(g, token_id, pos_id, &mut cache);
        let probs = softmax(g, &logits);
        let log_p = g.log(probs[target_id]);
        losses.push(g.neg(log_p));
    }
    let total = g.sum(&losses);
    Ok(g.mul(total, 1.0 / n as f64))
}

#[derive(Clone, Copy, Debug)]
struct StepStats {
    /// 1-based.
    step: usize,
    doc_index: usize,
    loss: f64,
    lr: f64,
}

/// Single-document, full-sequence steps over `docs[step % len]`.
struct Trainer {
    docs: Vec<String>,
    encoded: Vec<Vec<usize>>,
    adam: Adam,
    cfg: TrainConfig,
}

impl Trainer {
    fn new(docs: &[String], tokenizer: &Tokenizer, model: &Model, cfg: TrainConfig) -> GptResult<Self> {
        cfg.validate()?;
        if docs.is_empty() {
            return Err(GptError::Argument { name: "docs", reason: "need at least one training document".into() });
        }
        if tokenizer.vocab_size != model.vocab_size {
            return Err(GptError::Shape {
                matrix: "wte".into(),
                row: None,
                expected: tokenizer.vocab_size,
                got: model.vocab_size,
            });
        }
        let encoded = docs.iter().map(|d| tokenizer.encode(d)).collect::<GptResult<Vec<_>>>()?;
        Ok(Trainer { docs: docs.to_vec(), encoded, adam: Adam::new(model.num_params(), cfg.adam), cfg })
    }

    fn with_optimizer(mut self, snap: OptimizerSnapshot) -> GptResult<Self> {
        self.adam = Adam::restore(self.cfg.adam, snap, self.adam.m.len())?;
        if self.is_finished() {
            warn!("[train] optimizer already at step {} of {}", self.adam.t, self.cfg.num_steps);
        }
        Ok(self)
    }

    fn steps_done(&self) -> usize { self.adam.t }

    fn is_finished(&self) -> bool { self.adam.t >= self.cfg.num_steps }

    /// Forward + backward on the next document; leaves gradients on `model`.
    fn backward_step(&mut self, model: &mut Model) -> GptResult<StepStats> {
        let index = self.adam.t;
        if index >= self.cfg.num_steps {
            return Err(GptError::Argument {
                name: "num_steps",
                reason: format!("schedule exhausted after {} steps", self.cfg.num_steps),
            });
        }
        let doc_index = index % self.encoded.len();
        let mut g = Graph::for_model(model);
        let loss = sequence_loss(&mut g, model, &self.encoded[doc_index])?;
        let loss_value = g.value(loss);
        if !loss_value.is_finite() {
            return Err(GptError::Numerical(format!(
                "loss {loss_value} at step {} on {:?}",
                index + 1,
                self.docs[doc_index]
            )));
        }
        g.backward(loss);
        model.accumulate_grads(&g);
        Ok(StepStats {
            step: index + 1,
            doc_index,
            loss: loss_value,
            lr: linear_decay_lr(self.cfg.learning_rate, index, self.cfg.num_steps),
        })
    }

    fn apply_update(&mut self, model: &mut Model, stats: &StepStats) {
        self.adam.step(model, stats.lr);
        let every = self.cfg.log_every;
        if (every > 0 && stats.step % every == 0) || stats.step == self.cfg.num_steps {
            info!("[train] step {:4} / {:4} | loss {:.4} | lr {:.6}", stats.step, self.cfg.num_steps, stats.loss, stats.lr);
        }
    }

    fn step(&mut self, model: &mut Model) -> GptResult<StepStats> {
        let stats = self.backward_step(model)?;
        self.apply_update(model, &stats);
        Ok(stats)
    }

    /// Runs the rest of the schedule, returning each step's loss.
    fn run(&mut self, model: &mut Model) -> GptResult<Vec<f64>> {
        let mut losses = Vec::with_capacity(self.cfg.num_steps - self.steps_done().min(self.cfg.num_steps));
        while !self.is_finished() {
            losses.push(self.step(model)?.loss);
        }
        Ok(losses)
    }
}

// ============================================================
// 7) GENERATION
// ============================================================

#[derive(Clone, Copy, Debug)]
struct SampleConfig {
    num_samples: usize,
    temperature: f64,
    max_tokens: Option<usize>,
}

impl SampleConfig {
    /// Effective per-sample length bound, never past the context length.
    fn validate(&self, block_size: usize) -> GptResult<usize> {
        if self.num_samples == 0 {
            return Err(GptError::Argument { name: "num_samples", reason: "must be > 0".into() });
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(GptError::Argument { name: "temperature", reason: format!("({}) must be > 0", self.temperature) });
        }
        let max_tokens = self.max_tokens.map_or(block_size, |m| m.min(block_size));
        if max_tokens == 0 {
            return Err(GptError::Argument { name: "max_tokens", reason: "must be > 0".into() });
        }
        Ok(max_tokens)
    }
}

#[derive(Clone, Debug)]
struct Sample {
    /// Token characters as generated.
    raw: String,
    /// Composed for display.
    text: String,
    in_dataset: Option<bool>,
}

/// Token ids of one sample, terminator excluded.
fn sample_tokens(
    model: &Model,
    tokenizer: &Tokenizer,
    max_tokens: usize,
    temperature: f64,
    rng: &mut StdRng,
) -> GptResult<Vec<usize>> {
    let mut g = Graph::for_model(model);
    let mut cache = KvCache::new(model.cfg.n_layer);
    let mut token_id = tokenizer.bos;
    let mut out = Vec::new();
    for pos_id in 0..max_tokens.min(model.cfg.block_size) {
        let logits = model.forward(&mut g, token_id, pos_id, &mut cache);
        let scaled: Vec<NodeId> = logits.iter().map(|&l| g.div(l, temperature)).collect();
        let probs = softmax(&mut g, &scaled);
        let weights: Vec<f64> = probs.iter().map(|&p| g.value(p)).collect();
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| GptError::Numerical(format!("sampling weights at position {pos_id}: {e}")))?;
        token_id = dist.sample(rng);
        if token_id == tokenizer.bos {
            break;
        }
        out.push(token_id);
    }
    debug!("[sample] {} tokens over {} graph nodes", out.len(), g.len());
    Ok(out)
}

fn generate(
    model: &Model,
    tokenizer: &Tokenizer,
    charset: Charset,
    names: &BTreeSet<String>,
    cfg: &SampleConfig,
    rng: &mut StdRng,
) -> GptResult<Vec<Sample>> {
    let max_tokens = cfg.validate(model.cfg.block_size)?;
    (0..cfg.num_samples)
        .map(|_| -> GptResult<Sample> {
            let ids = sample_tokens(model, tokenizer, max_tokens, cfg.temperature, rng)?;
            let raw: String = ids.iter().filter_map(|&id| tokenizer.decode(id)).collect();
            let text = charset.compose(&raw);
            let in_dataset = (!names.is_empty()).then(|| names.contains(&text));
            Ok(Sample { raw, text, in_dataset })
        })
        .collect()
}

// ============================================================
// 8) CHECKPOINT SAVE/LOAD
// ============================================================

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    format_version: u32,
    config: ModelConfig,
    #[serde(default)]
    charset: Charset,
    tokenizer: Tokenizer,
    state_dict: BTreeMap<String, Vec<Vec<f64>>>,
    #[serde(default)]
    dataset_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    optimizer: Option<OptimizerSnapshot>,
}

struct Restored {
    model: Model,
    tokenizer: Tokenizer,
    charset: Charset,
    names: BTreeSet<String>,
    optimizer: Option<OptimizerSnapshot>,
}

impl Checkpoint {
    fn capture(
        model: &Model,
        tokenizer: &Tokenizer,
        charset: Charset,
        names: &BTreeSet<String>,
        adam: Option<&Adam>,
    ) -> Self {
        Checkpoint {
            format_version: FORMAT_VERSION,
            config: model.cfg,
            charset,
            tokenizer: tokenizer.clone(),
            state_dict: model.state_dict(),
            dataset_names: names.iter().cloned().collect(),
            optimizer: adam.map(Adam::snapshot),
        }
    }

    /// Validates everything before a single parameter is handed out.
    fn restore(self) -> GptResult<Restored> {
        if self.format_version != FORMAT_VERSION {
            return Err(GptError::Checkpoint(format!(
                "format_version {} (expected {FORMAT_VERSION})",
                self.format_version
            )));
        }
        let mut tokenizer = self.tokenizer;
        tokenizer.validate()?;
        tokenizer.rebuild_index();
        let model = Model::from_state_dict(self.config, tokenizer.vocab_size, &self.state_dict)?;
        if let Some(extra) = self.state_dict.keys().find(|k| model.matrix_index(k).is_none()) {
            return Err(GptError::Checkpoint(format!("unexpected matrix '{extra}' in state dict")));
        }
        Ok(Restored {
            model,
            tokenizer,
            charset: self.charset,
            names: self.dataset_names.into_iter().collect(),
            optimizer: self.optimizer,
        })
    }
}

fn save_checkpoint(path: &Path, ckpt: &Checkpoint) -> GptResult<()> {
    ensure_parent(path)?;
    fs::write(path, serde_json::to_string(ckpt)?)?;
    info!("[ckpt] saved checkpoint: {}", path.display());
    Ok(())
}

fn load_checkpoint(path: &Path) -> GptResult<Checkpoint> {
    if !path.exists() {
        return Err(GptError::NotFound(path.to_path_buf()));
    }
    let json = fs::read_to_string(path)?;
    let ckpt: Checkpoint = serde_json::from_str(&json)?;
    info!("[ckpt] loaded checkpoint: {}", path.display());
    Ok(ckpt)
}

fn ensure_parent(path: &Path) -> GptResult<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => Ok(fs::create_dir_all(dir)?),
        _ => Ok(()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> GptResult<()> {
    ensure_parent(path)?;
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

// ============================================================
// 9) TRAINING TRACE EXPORT
// ============================================================

#[derive(Clone, Debug, Serialize)]
struct TrackedRow {
    id: String,
    label: String,
    matrix: String,
    row_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_char_nfd: Option<char>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_char_display: Option<char>,
    #[serde(skip)]
    source: String,
}

#[derive(Clone, Debug, Serialize)]
struct ParamTrace {
    grad: Vec<f64>,
    after: Vec<f64>,
}

#[derive(Clone, Debug, Serialize)]
struct TraceStep {
    step: usize,
    word: String,
    loss: Option<f64>,
    learning_rate: f64,
    params: BTreeMap<String, ParamTrace>,
}

#[derive(Clone, Debug, Serialize)]
struct OptimizerInfo {
    name: &'static str,
    beta1: f64,
    beta2: f64,
    eps: f64,
    base_learning_rate: f64,
    schedule: &'static str,
}

#[derive(Clone, Debug, Serialize)]
struct TrainingTrace {
    format_version: u32,
    num_steps: usize,
    step_options: Vec<usize>,
    optimizer: OptimizerInfo,
    parameter_options: Vec<TrackedRow>,
    steps: Vec<TraceStep>,
}

fn round_to(x: f64, digits: u32) -> f64 {
    let scale = 10f64.powi(digits as i32);
    (x * scale).round() / scale
}

fn round_vec(xs: &[f64], digits: u32) -> Vec<f64> { xs.iter().map(|&x| round_to(x, digits)).collect() }

/// Two token rows (embedding + LM head), position 0, and W_Q row 0 of layer 0.
fn resolve_tracked_rows(tokenizer: &Tokenizer, charset: Charset) -> GptResult<Vec<TrackedRow>> {
    let mut used: Vec<usize> = Vec::new();
    let mut pick = |preferred: char| -> GptResult<(char, usize)> {
        let candidates = std::iter::once(preferred).chain(tokenizer.uchars.iter().copied());
        for c in candidates {
            if let Some(id) = tokenizer.id_of(c).filter(|id| !used.contains(id)) {
                used.push(id);
                return Ok((c, id));
            }
        }
        Err(GptError::Argument { name: "tracked_rows", reason: "alphabet has fewer than two characters".into() })
    };
    let [first, second] = charset.trace_preferences();
    let (c_emb, id_emb) = pick(first)?;
    let (c_head, id_head) = pick(second)?;

    let token_row = |prefix: &str, label: &str, matrix: &str, c: char, id: usize| TrackedRow {
        id: format!("{prefix}_{}", charset.slug(c)),
        label: format!("{} {label}", charset.describe(c)),
        matrix: matrix.to_string(),
        row_index: id,
        token_char_nfd: Some(c),
        token_char_display: Some(charset.display(c)),
        source: matrix.to_string(),
    };
    Ok(vec![
        token_row("token", "token embedding", "wte", c_emb, id_emb),
        token_row("lm_head", "LM Head parameter", "lm_head", c_head, id_head),
        TrackedRow {
            id: "position_0".into(),
            label: "POS 0 position embedding".into(),
            matrix: "wpe".into(),
            row_index: 0,
            token_char_nfd: None,
            token_char_display: None,
            source: "wpe".into(),
        },
        TrackedRow {
            id: "attn_wq_row_0".into(),
            label: "W_Q row 0".into(),
            matrix: "attn_wq".into(),
            row_index: 0,
            token_char_nfd: None,
            token_char_display: None,
            source: "layer0.attn_wq".into(),
        },
    ])
}

fn tracked_values(model: &Model, sources: &[usize], rows: &[TrackedRow], digits: u32, grad: bool) -> Vec<Vec<f64>> {
    rows.iter()
        .zip(sources)
        .map(|(row, &m)| {
            let mat = &model.mats[m];
            let src = if grad { &mat.grad } else { &mat.data };
            round_vec(&src[row.row_index], digits)
        })
        .collect()
}

/// Runs the trainer's whole schedule, recording tracked rows before (grad)
/// and after (values) each update. Record 0 is the untrained model.
fn record_training_trace(
    model: &mut Model,
    tokenizer: &Tokenizer,
    charset: Charset,
    trainer: &mut Trainer,
    digits: u32,
) -> GptResult<TrainingTrace> {
    let rows = resolve_tracked_rows(tokenizer, charset)?;
    let sources: Vec<usize> = rows
        .iter()
        .map(|r| model.matrix_index(&r.source).ok_or_else(|| GptError::MissingMatrix(r.source.clone())))
        .collect::<GptResult<_>>()?;
    let mut steps = Vec::with_capacity(trainer.cfg.num_steps + 1);
    let initial: BTreeMap<String, ParamTrace> = tracked_values(model, &sources, &rows, digits, false)
        .into_iter()
        .enumerate()
        .map(|(k, after)| (rows[k].id.clone(), ParamTrace { grad: vec![0.0; after.len()], after }))
        .collect();
    steps.push(TraceStep {
        step: 0,
        word: trainer.docs.first().map(|d| charset.compose(d)).unwrap_or_default(),
        loss: None,
        learning_rate: round_to(trainer.cfg.learning_rate, digits),
        params: initial,
    });

    while !trainer.is_finished() {
        let stats = trainer.backward_step(model)?;
        let grads = tracked_values(model, &sources, &rows, digits, true);
        trainer.apply_update(model, &stats);
        let afters = tracked_values(model, &sources, &rows, digits, false);
        let params = grads
            .into_iter()
            .zip(afters)
            .enumerate()
            .map(|(k, (grad, after))| (rows[k].id.clone(), ParamTrace { grad, after }))
            .collect();
        steps.push(TraceStep {
            step: stats.step,
            word: charset.compose(&trainer.docs[stats.doc_index]),
            loss: Some(round_to(stats.loss, digits)),
            learning_rate: round_to(stats.lr, digits),
            params,
        });
    }

    let num_steps = trainer.cfg.num_steps;
    let mut step_options: Vec<usize> = STEP_OPTIONS.iter().copied().filter(|&s| s <= num_steps).collect();
    if step_options.last() != Some(&num_steps) {
        step_options.push(num_steps);
    }
    let adam = trainer.cfg.adam;
    Ok(TrainingTrace {
        format_version: FORMAT_VERSION,
        num_steps,
        step_options,
        optimizer: OptimizerInfo {
            name: "Adam",
            beta1: adam.beta1,
            beta2: adam.beta2,
            eps: adam.eps,
            base_learning_rate: trainer.cfg.learning_rate,
            schedule: "linear_decay(lr_t = lr * (1 - step / num_steps))",
        },
        parameter_options: rows,
        steps,
    })
}

// ============================================================
// 10) EMBEDDING SNAPSHOT EXPORT
// ============================================================

#[derive(Serialize)]
struct SnapshotTokenizer {
    uchars: Vec<char>,
    bos: usize,
}

#[derive(Serialize)]
struct AttentionSnapshot {
    layer_index: usize,
    head_index: usize,
    n_head: usize,
    head_dim: usize,
    attn_wq: Vec<Vec<f64>>,
    attn_wk: Vec<Vec<f64>>,
    attn_wv: Vec<Vec<f64>>,
    attn_wo: Vec<Vec<f64>>,
}

#[derive(Serialize)]
struct MlpSnapshot {
    layer_index: usize,
    mlp_fc1: Vec<Vec<f64>>,
    mlp_fc2: Vec<Vec<f64>>,
}

#[derive(Serialize)]
struct EmbeddingSnapshot {
    n_embd: usize,
    block_size: usize,
    tokenizer: SnapshotTokenizer,
    wte: Vec<Vec<f64>>,
    wpe: Vec<Vec<f64>>,
    attention: AttentionSnapshot,
    mlp: MlpSnapshot,
    lm_head: Vec<Vec<f64>>,
}

/// Layer 0 only; the model always has at least one layer.
fn embedding_snapshot(model: &Model, tokenizer: &Tokenizer) -> EmbeddingSnapshot {
    let layer = |which| model.layer_mat(0, which).data.clone();
    EmbeddingSnapshot {
        n_embd: model.cfg.n_embd,
        block_size: model.cfg.block_size,
        tokenizer: SnapshotTokenizer { uchars: tokenizer.uchars.clone(), bos: tokenizer.bos },
        wte: model.mat(WTE).data.clone(),
        wpe: model.mat(WPE).data.clone(),
        attention: AttentionSnapshot {
            layer_index: 0,
            head_index: 0,
            n_head: model.cfg.n_head,
            head_dim: model.cfg.head_dim(),
            attn_wq: layer(LayerMat::AttnWq),
            attn_wk: layer(LayerMat::AttnWk),
            attn_wv: layer(LayerMat::AttnWv),
            attn_wo: layer(LayerMat::AttnWo),
        },
        mlp: MlpSnapshot { layer_index: 0, mlp_fc1: layer(LayerMat::MlpFc1), mlp_fc2: layer(LayerMat::MlpFc2) },
        lm_head: model.mat(LM_HEAD).data.clone(),
    }
}

// ============================================================
// 11) CLI
// ============================================================

#[derive(Parser)]
#[command(name = "namegpt", about = "Train and sample a character-level name GPT")]
struct Cli {
    /// JSON settings file; flags below override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train on the corpus, save a checkpoint, then sample.
    Train {
        #[command(flatten)]
        overrides: Overrides,
        /// Continue from the checkpoint's parameters and optimizer state.
        #[arg(long)]
        resume: bool,
    },
    /// Sample names from a saved checkpoint.
    Sample {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Fresh seeded run that exports the per-step training trace.
    Trace {
        #[command(flatten)]
        overrides: Overrides,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Export embedding/attention matrices of a checkpoint.
    Snapshot {
        #[command(flatten)]
        overrides: Overrides,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Default)]
struct Overrides {
    #[arg(long)]
    data: Option<PathBuf>,
    #[arg(long, value_enum)]
    charset: Option<Charset>,
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    steps: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    n_layer: Option<usize>,
    #[arg(long)]
    n_embd: Option<usize>,
    #[arg(long)]
    block_size: Option<usize>,
    #[arg(long)]
    n_head: Option<usize>,
    #[arg(long)]
    temperature: Option<f64>,
    #[arg(long)]
    num_samples: Option<usize>,
    #[arg(long)]
    max_tokens: Option<usize>,
}

impl Overrides {
    fn apply(self, s: &mut Settings) {
        if let Some(v) = self.data { s.data_path = v; }
        if let Some(v) = self.charset { s.charset = v; }
        if let Some(v) = self.checkpoint { s.checkpoint_path = v; }
        if let Some(v) = self.seed { s.seed = v; }
        if let Some(v) = self.steps { s.num_steps = v; }
        if let Some(v) = self.lr { s.learning_rate = v; }
        if let Some(v) = self.n_layer { s.model.n_layer = v; }
        if let Some(v) = self.n_embd { s.model.n_embd = v; }
        if let Some(v) = self.block_size { s.model.block_size = v; }
        if let Some(v) = self.n_head { s.model.n_head = v; }
        if let Some(v) = self.temperature { s.temperature = v; }
        if let Some(v) = self.num_samples { s.num_samples = v; }
        if let Some(v) = self.max_tokens { s.max_tokens = Some(v); }
    }
}

/// One output line; Hangul samples also show the jamo the model produced.
fn format_sample(index: usize, sample: &Sample, charset: Charset) -> String {
    let membership = sample.in_dataset.map_or_else(|| "N/A".to_string(), |b| b.to_string());
    let mut line = format!("sample {:2}: {} | in_dataset: {}", index + 1, sample.text, membership);
    if charset == Charset::Hangul {
        line.push_str(&format!(" | jamo: {}", sample.raw));
    }
    line
}

fn print_samples(samples: &[Sample], charset: Charset) {
    println!("\n--- inference ---");
    for (i, s) in samples.iter().enumerate() {
        println!("{}", format_sample(i, s, charset));
    }
}

fn run_train(s: &Settings, resume: bool) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(s.seed);
    let corpus = load_corpus(&s.data_path, s.charset, &mut rng).context("loading dataset")?;
    let (mut model, tokenizer, snapshot) = if resume {
        let restored = load_checkpoint(&s.checkpoint_path)?.restore().context("restoring checkpoint")?;
        (restored.model, restored.tokenizer, restored.optimizer)
    } else {
        s.model.validate()?;
        let tokenizer = Tokenizer::from_docs(&corpus.docs);
        let model = Model::new(s.model, tokenizer.vocab_size, s.init_std, &mut rng)?;
        (model, tokenizer, None)
    };
    info!("[init] vocab size: {}", tokenizer.vocab_size);
    info!("[init] num params: {}", model.num_params());

    let mut trainer = Trainer::new(&corpus.docs, &tokenizer, &model, s.train_config())?;
    if let Some(snap) = snapshot {
        trainer = trainer.with_optimizer(snap)?;
        info!("[train] resuming at step {}", trainer.steps_done());
    }
    trainer.run(&mut model)?;

    let ckpt = Checkpoint::capture(&model, &tokenizer, s.charset, &corpus.names, Some(&trainer.adam));
    save_checkpoint(&s.checkpoint_path, &ckpt)?;

    let mut sample_rng = StdRng::seed_from_u64(s.seed);
    let samples = generate(&model, &tokenizer, s.charset, &corpus.names, &s.sample_config(), &mut sample_rng)?;
    print_samples(&samples, s.charset);
    Ok(())
}

fn run_sample(s: &Settings) -> anyhow::Result<()> {
    let restored = load_checkpoint(&s.checkpoint_path)?.restore().context("restoring checkpoint")?;
    info!("[sample] vocab size: {}, block size: {}", restored.tokenizer.vocab_size, restored.model.cfg.block_size);
    let mut rng = StdRng::seed_from_u64(s.seed);
    let samples = generate(
        &restored.model,
        &restored.tokenizer,
        restored.charset,
        &restored.names,
        &s.sample_config(),
        &mut rng,
    )?;
    print_samples(&samples, restored.charset);
    Ok(())
}

fn run_trace(s: &Settings) -> anyhow::Result<()> {
    s.model.validate()?;
    let mut rng = StdRng::seed_from_u64(s.seed);
    let corpus = load_corpus(&s.data_path, s.charset, &mut rng).context("loading dataset")?;
    let tokenizer = Tokenizer::from_docs(&corpus.docs);
    let mut model = Model::new(s.model, tokenizer.vocab_size, s.init_std, &mut rng)?;
    let mut trainer = Trainer::new(&corpus.docs, &tokenizer, &model, s.train_config())?;
    let trace = record_training_trace(&mut model, &tokenizer, s.charset, &mut trainer, s.trace_digits())?;
    write_json(&s.trace_path, &trace)?;
    info!(
        "[trace] saved training trace: {} ({} records, {} tracked rows)",
        s.trace_path.display(),
        trace.steps.len(),
        trace.parameter_options.len()
    );
    Ok(())
}

fn run_snapshot(s: &Settings) -> anyhow::Result<()> {
    let restored = load_checkpoint(&s.checkpoint_path)?.restore().context("restoring checkpoint")?;
    let snapshot = embedding_snapshot(&restored.model, &restored.tokenizer);
    write_json(&s.snapshot_path, &snapshot)?;
    info!(
        "[trace] saved embedding snapshot: {} (wte {} rows, wpe {} rows, head_dim {})",
        s.snapshot_path.display(),
        snapshot.wte.len(),
        snapshot.wpe.len(),
        snapshot.attention.head_dim
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    match cli.command {
        Command::Train { overrides, resume } => {
            overrides.apply(&mut settings);
            run_train(&settings, resume)
        }
        Command::Sample { overrides } => {
            overrides.apply(&mut settings);
            run_sample(&settings)
        }
        Command::Trace { overrides, out } => {
            overrides.apply(&mut settings);
            if let Some(out) = out { settings.trace_path = out; }
            run_trace(&settings)
        }
        Command::Snapshot { overrides, out } => {
            overrides.apply(&mut settings);
            if let Some(out) = out { settings.snapshot_path = out; }
            run_snapshot(&settings)
        }
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn tiny_cfg() -> ModelConfig {
        ModelConfig { n_layer: 1, n_embd: 4, block_size: 4, n_head: 2 }
    }

    fn adam_cfg() -> AdamConfig {
        AdamConfig { beta1: 0.85, beta2: 0.99, eps: 1e-8 }
    }

    fn train_cfg(num_steps: usize, learning_rate: f64) -> TrainConfig {
        TrainConfig { num_steps, learning_rate, adam: adam_cfg(), log_every: 0 }
    }

    fn docs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn tiny_model(docs: &[String], seed: u64) -> (Tokenizer, Model) {
        let mut rng = StdRng::seed_from_u64(seed);
        let tok = Tokenizer::from_docs(docs);
        let model = Model::new(tiny_cfg(), tok.vocab_size, 0.08, &mut rng).unwrap();
        (tok, model)
    }

    fn logits_for(model: &Model, tokens: &[usize]) -> Vec<Vec<f64>> {
        let mut g = Graph::for_model(model);
        let mut cache = KvCache::new(model.cfg.n_layer);
        tokens
            .iter()
            .enumerate()
            .map(|(pos, &t)| {
                let out = model.forward(&mut g, t, pos, &mut cache);
                out.iter().map(|&n| g.value(n)).collect()
            })
            .collect()
    }

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("namegpt_{tag}_{}.json", std::process::id()))
    }

    /// Central difference of `f` at `x0` against the graph's gradient.
    fn check_grad(x0: f64, f: impl Fn(&mut Graph, NodeId) -> NodeId) {
        let mut g = Graph::new();
        let x = g.leaf(x0);
        let y = f(&mut g, x);
        g.backward(y);
        let analytic = g.grad(x);

        let h = 1e-6;
        let eval = |v: f64| {
            let mut g = Graph::new();
            let x = g.leaf(v);
            let y = f(&mut g, x);
            g.value(y)
        };
        let numeric = (eval(x0 + h) - eval(x0 - h)) / (2.0 * h);
        assert!((analytic - numeric).abs() < 1e-5, "analytic {analytic} vs numeric {numeric}");
    }

    // ---- autograd ----

    #[test]
    fn test_op_gradients_match_finite_differences() {
        check_grad(0.7, |g, x| g.add(x, 2.5));
        check_grad(0.7, |g, x| g.mul(x, -1.5));
        check_grad(0.7, |g, x| g.mul(x, x));
        check_grad(0.7, |g, x| g.pow(x, 3.0));
        check_grad(0.7, |g, x| g.pow(x, -0.5));
        check_grad(0.7, |g, x| g.log(x));
        check_grad(0.7, |g, x| g.exp(x));
        check_grad(0.7, |g, x| g.relu(x));
        check_grad(-0.7, |g, x| g.relu(x));
        check_grad(0.7, |g, x| g.neg(x));
        check_grad(0.7, |g, x| {
            let y = g.leaf(1.3);
            g.sub(y, x)
        });
        check_grad(0.7, |g, x| {
            let y = g.leaf(1.3);
            g.div(y, x)
        });
        check_grad(0.7, |g, x| g.div(x, 4.0));
        check_grad(0.7, |g, x| {
            let e = g.exp(x);
            let s = g.add(e, x);
            g.log(s)
        });
    }

    #[test]
    fn test_relu_at_zero() {
        let mut g = Graph::new();
        let x = g.leaf(0.0);
        let y = g.relu(x);
        g.backward(y);
        assert_eq!(g.value(y), 0.0);
        assert_eq!(g.grad(x), 0.0);
    }

    #[test]
    fn test_shared_node_accumulates_every_path() {
        // d = (3a) * (a + 1)  =>  dd/da = 6a + 3
        let mut g = Graph::new();
        let a = g.leaf(2.0);
        let b = g.mul(a, 3.0);
        let c = g.add(a, 1.0);
        let d = g.mul(b, c);
        g.backward(d);
        assert_eq!(g.value(d), 18.0);
        assert_eq!(g.grad(a), 15.0);
        assert_eq!(g.grad(b), 3.0);
        assert_eq!(g.grad(c), 6.0);
    }

    #[test]
    fn test_self_multiply_counts_both_operands() {
        let mut g = Graph::new();
        let x = g.leaf(3.0);
        let y = g.mul(x, x);
        g.backward(y);
        assert_eq!(g.grad(x), 6.0);
    }

    #[test]
    fn test_topo_order_is_unique_and_predecessors_first() {
        let mut g = Graph::new();
        let a = g.leaf(1.0);
        let b = g.add(a, a);
        let c = g.mul(b, a);
        let d = g.add(c, b);
        let _unreachable = g.leaf(9.0);
        let order = g.topo_order(d);
        assert_eq!(order.len(), 4);
        let pos = |id: NodeId| order.iter().position(|&o| o == id).unwrap();
        assert!(pos(a) < pos(b) && pos(b) < pos(c) && pos(c) < pos(d));
        assert_eq!(*order.last().unwrap(), d);
    }

    #[test]
    fn test_deep_chain_backward() {
        let mut g = Graph::new();
        let x = g.leaf(0.0);
        let mut acc = x;
        for _ in 0..200_000 {
            acc = g.add(acc, 1.0);
        }
        g.backward(acc);
        assert_eq!(g.value(acc), 200_000.0);
        assert_eq!(g.grad(x), 1.0);
    }

    #[test]
    fn test_sum_of_nothing_is_zero() {
        let mut g = Graph::new();
        let s = g.sum(&[]);
        assert_eq!(g.value(s), 0.0);
    }

    // ---- primitives ----

    #[test]
    fn test_softmax_normalizes_and_ignores_shift() {
        let mut rng = StdRng::seed_from_u64(17);
        for trial in 0..20 {
            let len = rng.gen_range(1..12);
            let scale = [0.01, 1.0, 30.0][trial % 3];
            let logits: Vec<f64> = (0..len).map(|_| rng.gen_range(-1.0..1.0) * scale).collect();
            for shift in [-750.0, -3.5, 0.0, 0.25, 100.0, 640.0] {
                let mut g = Graph::new();
                let xs: Vec<NodeId> = logits.iter().map(|&v| g.leaf(v)).collect();
                let shifted: Vec<NodeId> = logits.iter().map(|&v| g.leaf(v + shift)).collect();
                let p = softmax(&mut g, &xs);
                let q = softmax(&mut g, &shifted);
                let total: f64 = q.iter().map(|&n| g.value(n)).sum();
                assert!((total - 1.0).abs() < 1e-9, "sum {total} for shift {shift}");
                for (&a, &b) in p.iter().zip(&q) {
                    assert!((g.value(a) - g.value(b)).abs() < 1e-9, "shift {shift} moved a probability");
                }
            }
        }

        let mut g = Graph::new();
        let xs: Vec<NodeId> = [1.0, 2.0, 3.0].iter().map(|&v| g.leaf(v)).collect();
        let p = softmax(&mut g, &xs);
        assert!(g.value(p[2]) > g.value(p[1]) && g.value(p[1]) > g.value(p[0]));
    }

    #[test]
    fn test_softmax_handles_large_logits() {
        let mut g = Graph::new();
        let xs: Vec<NodeId> = [1000.0, 1001.0, 999.0].iter().map(|&v| g.leaf(v)).collect();
        let p = softmax(&mut g, &xs);
        for &n in &p {
            assert!(g.value(n).is_finite());
        }
        let total: f64 = p.iter().map(|&n| g.value(n)).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rmsnorm_unit_mean_square() {
        let mut rng = StdRng::seed_from_u64(23);
        for _ in 0..30 {
            let len = rng.gen_range(1..20);
            // signed, magnitudes spread over 1..1000
            let xs: Vec<f64> = (0..len)
                .map(|_| {
                    let magnitude = 10f64.powf(rng.gen_range(0.0..3.0));
                    if rng.gen_bool(0.5) { -magnitude } else { magnitude }
                })
                .collect();
            let mut g = Graph::new();
            let nodes: Vec<NodeId> = xs.iter().map(|&v| g.leaf(v)).collect();
            let y = rmsnorm(&mut g, &nodes);
            let ms: f64 = y.iter().map(|&n| g.value(n).powi(2)).sum::<f64>() / y.len() as f64;
            assert!((ms - 1.0).abs() < 1e-4, "mean square {ms} for {xs:?}");
            for (&yi, &xi) in y.iter().zip(&xs) {
                assert_eq!(g.value(yi).signum(), xi.signum());
            }
        }
    }

    #[test]
    fn test_linear_is_matvec() {
        let w = MatrixParam::from_rows("w".into(), vec![vec![1.0, 2.0], vec![3.0, 4.0]], 2, 2, 0).unwrap();
        let mut g = Graph::new();
        for row in &w.data {
            for &v in row {
                g.leaf(v);
            }
        }
        let x = [g.leaf(5.0), g.leaf(6.0)];
        let y = linear(&mut g, &x, &w);
        assert_eq!(g.value(y[0]), 17.0);
        assert_eq!(g.value(y[1]), 39.0);
        g.backward(y[1]);
        assert_eq!(g.grad(w.node(1, 0)), 5.0);
        assert_eq!(g.grad(w.node(0, 0)), 0.0);
        assert_eq!(g.grad(x[0]), 3.0);
    }

    // ---- config ----

    #[test]
    fn test_config_requires_divisible_heads() {
        let cfg = ModelConfig { n_layer: 1, n_embd: 10, block_size: 8, n_head: 4 };
        match cfg.validate() {
            Err(GptError::Config { field, .. }) => assert_eq!(field, "n_embd"),
            other => panic!("expected config error, got {other:?}"),
        }
        let zero = ModelConfig { n_layer: 0, ..ModelConfig::default() };
        assert!(matches!(zero.validate(), Err(GptError::Config { field: "n_layer", .. })));
        assert_eq!(ModelConfig::default().head_dim(), 4);
    }

    #[test]
    fn test_settings_fill_missing_fields_with_defaults() {
        let s: Settings = serde_json::from_str(r#"{"num_steps": 5, "charset": "hangul"}"#).unwrap();
        assert_eq!(s.num_steps, 5);
        assert_eq!(s.charset, Charset::Hangul);
        assert_eq!(s.learning_rate, 0.003);
        assert_eq!(s.model, ModelConfig::default());
        assert_eq!(s.temperature, 0.5);
        assert_eq!(s.trace_digits(), 8);

        let latin = Settings::default();
        assert_eq!(latin.trace_digits(), 4);
        let pinned: Settings = serde_json::from_str(r#"{"round_digits": 6}"#).unwrap();
        assert_eq!(pinned.trace_digits(), 6);
    }

    // ---- corpus + tokenizer ----

    #[test]
    fn test_latin_corpus_filters_and_lowercases() {
        let mut rng = StdRng::seed_from_u64(1);
        let corpus = Corpus::from_lines(["Anna", "bob", "x1", "", "émile", " eve "], Charset::Latin, &mut rng).unwrap();
        let mut sorted = corpus.docs.clone();
        sorted.sort();
        assert_eq!(sorted, docs(&["anna", "bob", "eve"]));
        assert!(corpus.names.contains("anna"));

        let err = Corpus::from_lines(["123", "A-B"], Charset::Latin, &mut rng).unwrap_err();
        assert!(matches!(err, GptError::EmptyCorpus { pattern: "^[a-z]+$" }));
    }

    #[test]
    fn test_hangul_decompose_compose() {
        let jamo = Charset::Hangul.decompose("김민수");
        let chars: Vec<char> = jamo.chars().collect();
        assert_eq!(chars.len(), 8);
        assert_eq!(chars[0], '\u{1100}');
        assert_eq!(chars[1], '\u{1175}');
        assert_eq!(chars[2], '\u{11B7}');
        assert_eq!(Charset::Hangul.compose(&jamo), "김민수");
        // a run cut short by sampling stays as bare jamo
        assert_eq!(Charset::Hangul.compose("\u{1100}"), "\u{1100}");
        assert_eq!(Charset::Latin.decompose("anna"), "anna");
    }

    #[test]
    fn test_hangul_corpus_keeps_surface_names() {
        let mut rng = StdRng::seed_from_u64(3);
        let corpus = Corpus::from_lines(["민수", "kim", "서연"], Charset::Hangul, &mut rng).unwrap();
        assert_eq!(corpus.docs.len(), 2);
        assert!(corpus.names.contains("서연"));
        assert!(corpus.docs.iter().all(|d| d.chars().all(|c| !is_syllable(c))));
    }

    #[test]
    fn test_tokenizer_layout() {
        let tok = Tokenizer::from_docs(&docs(&["cab", "abba"]));
        assert_eq!(tok.uchars, vec!['a', 'b', 'c']);
        assert_eq!(tok.bos, 3);
        assert_eq!(tok.vocab_size, 4);
        assert_eq!(tok.encode("cab").unwrap(), vec![3, 2, 0, 1, 3]);
        assert_eq!(tok.decode(1), Some('b'));
        assert_eq!(tok.decode(tok.bos), None);
        assert!(matches!(tok.encode("cat"), Err(GptError::UnknownChar('t'))));
        assert!(tok.validate().is_ok());
    }

    // ---- model ----

    #[test]
    fn test_forward_shape_and_cache_growth() {
        let (tok, model) = tiny_model(&docs(&["aba", "aab"]), 42);
        assert_eq!(model.num_params(), 3 * 4 + 4 * 4 + 3 * 4 + 4 * 16 + 2 * 64);
        let mut g = Graph::for_model(&model);
        let mut cache = KvCache::new(1);
        for (pos, &t) in [tok.bos, 0, 1].iter().enumerate() {
            let logits = model.forward(&mut g, t, pos, &mut cache);
            assert_eq!(logits.len(), tok.vocab_size);
            assert_eq!(cache.positions(), pos + 1);
        }
        assert_eq!(cache.values[0].len(), 3);
    }

    #[test]
    fn test_attention_is_causal() {
        let (tok, model) = tiny_model(&docs(&["aba", "aab"]), 42);
        let mut g = Graph::for_model(&model);
        let mut left = KvCache::new(1);
        let mut right = KvCache::new(1);
        let seq_l = [tok.bos, 0, 1, 0];
        let seq_r = [tok.bos, 0, 0, 1];
        let mut out_l = Vec::new();
        let mut out_r = Vec::new();
        // interleaved on one graph; the caches must not leak into each other
        for pos in 0..4 {
            let l = model.forward(&mut g, seq_l[pos], pos, &mut left);
            out_l.push(l.iter().map(|&n| g.value(n)).collect::<Vec<_>>());
            let r = model.forward(&mut g, seq_r[pos], pos, &mut right);
            out_r.push(r.iter().map(|&n| g.value(n)).collect::<Vec<_>>());
        }
        assert_eq!(out_l[0], out_r[0]);
        assert_eq!(out_l[1], out_r[1]);
        assert_ne!(out_l[2], out_r[2]);
        assert_eq!(out_l, logits_for(&model, &seq_l));
    }

    #[test]
    fn test_loss_of_untrained_model_is_near_uniform() {
        let (tok, model) = tiny_model(&docs(&["aba", "aab"]), 42);
        let mut g = Graph::for_model(&model);
        let loss = sequence_loss(&mut g, &model, &tok.encode("aba").unwrap()).unwrap();
        let uniform = (tok.vocab_size as f64).ln();
        assert!((g.value(loss) - uniform).abs() < 0.5, "loss {}", g.value(loss));
        assert!(sequence_loss(&mut g, &model, &[tok.bos]).is_err());
    }

    #[test]
    fn test_long_document_is_truncated_to_block() {
        let d = docs(&["abababababab"]);
        let (tok, model) = tiny_model(&d, 5);
        let mut g = Graph::for_model(&model);
        let loss = sequence_loss(&mut g, &model, &tok.encode(&d[0]).unwrap()).unwrap();
        assert!(g.value(loss).is_finite());
    }

    // ---- optimizer + training ----

    #[test]
    fn test_adam_first_step_closed_form() {
        let (_, mut model) = tiny_model(&docs(&["ab"]), 9);
        let before = model.mats[WTE].data[0][0];
        let untouched = model.mats[LM_HEAD].data[1][2];
        model.mats[WTE].grad[0][0] = 0.5;
        let mut adam = Adam::new(model.num_params(), adam_cfg());
        adam.step(&mut model, 0.01);
        let expected = before - 0.01 * 0.5 / (0.5 + 1e-8);
        assert!((model.mats[WTE].data[0][0] - expected).abs() < 1e-12);
        assert_eq!(model.mats[LM_HEAD].data[1][2], untouched);
        assert_eq!(adam.t, 1);
        assert!(model.mats.iter().all(|m| m.grad.iter().flatten().all(|&g| g == 0.0)));
    }

    #[test]
    fn test_adam_step_clears_every_gradient() {
        let (_, mut model) = tiny_model(&docs(&["ab"]), 3);
        for mat in model.mats.iter_mut() {
            mat.grad.iter_mut().flatten().for_each(|g| *g = -0.25);
        }
        let mut adam = Adam::new(model.num_params(), adam_cfg());
        adam.step(&mut model, 0.01);
        assert!(model.mats.iter().all(|m| m.grad.iter().flatten().all(|&g| g == 0.0)));
        // every moment saw the gradient before it was cleared
        assert!(adam.m.iter().all(|&m| m < 0.0));
    }

    #[test]
    fn test_linear_decay_schedule() {
        assert_eq!(linear_decay_lr(0.01, 0, 100), 0.01);
        assert!((linear_decay_lr(0.01, 50, 100) - 0.005).abs() < 1e-15);
        let last = linear_decay_lr(0.01, 99, 100);
        assert!(last > 0.0 && last < 0.0002);
    }

    #[test]
    fn test_training_config_validation() {
        assert!(train_cfg(0, 0.01).validate().is_err());
        assert!(train_cfg(10, 0.0).validate().is_err());
        let mut bad_beta = train_cfg(10, 0.01);
        bad_beta.adam.beta2 = 1.0;
        assert!(matches!(bad_beta.validate(), Err(GptError::Config { field: "beta2", .. })));
    }

    #[test]
    fn test_training_is_deterministic() {
        let d = docs(&["aba", "aab"]);
        let run = || {
            let (tok, mut model) = tiny_model(&d, 7);
            let mut trainer = Trainer::new(&d, &tok, &model, train_cfg(6, 0.01)).unwrap();
            let losses = trainer.run(&mut model).unwrap();
            (losses, model.state_dict())
        };
        let (la, sa) = run();
        let (lb, sb) = run();
        assert_eq!(la.len(), 6);
        assert_eq!(la, lb);
        assert_eq!(sa, sb);
    }

    #[test]
    fn test_steps_cycle_through_documents() {
        let d = docs(&["ab", "ba", "aa"]);
        let (tok, mut model) = tiny_model(&d, 2);
        let mut trainer = Trainer::new(&d, &tok, &model, train_cfg(5, 0.01)).unwrap();
        let picked: Vec<usize> = (0..5).map(|_| trainer.step(&mut model).unwrap().doc_index).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1]);
        assert!(trainer.is_finished());
        assert!(trainer.step(&mut model).is_err());
    }

    #[test]
    fn test_loss_decreases_when_memorizing() {
        let d = docs(&["ab"]);
        let (tok, mut model) = tiny_model(&d, 11);
        let mut trainer = Trainer::new(&d, &tok, &model, train_cfg(120, 0.05)).unwrap();
        let losses = trainer.run(&mut model).unwrap();
        let head: f64 = losses[..10].iter().sum::<f64>() / 10.0;
        let tail: f64 = losses[losses.len() - 10..].iter().sum::<f64>() / 10.0;
        assert!(tail < head * 0.5, "head {head} tail {tail}");
    }

    #[test]
    fn test_trainer_rejects_unknown_characters() {
        let (tok, model) = tiny_model(&docs(&["ab"]), 1);
        let err = Trainer::new(&docs(&["abc"]), &tok, &model, train_cfg(3, 0.01)).err();
        assert!(matches!(err, Some(GptError::UnknownChar('c'))));
    }

    // ---- checkpoint ----

    #[test]
    fn test_checkpoint_roundtrip_reproduces_logits() {
        let d = docs(&["aba", "aab"]);
        let (tok, mut model) = tiny_model(&d, 4);
        let mut trainer = Trainer::new(&d, &tok, &model, train_cfg(3, 0.01)).unwrap();
        trainer.run(&mut model).unwrap();
        let names: BTreeSet<String> = d.iter().cloned().collect();

        let path = temp_path("roundtrip");
        save_checkpoint(&path, &Checkpoint::capture(&model, &tok, Charset::Latin, &names, Some(&trainer.adam))).unwrap();
        let restored = load_checkpoint(&path).unwrap().restore().unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(restored.tokenizer.uchars, tok.uchars);
        assert_eq!(restored.tokenizer.id_of('b'), Some(1));
        assert_eq!(restored.names, names);
        assert_eq!(restored.optimizer.map(|o| o.step), Some(3));
        let seq = [tok.bos, 0, 1, 0];
        assert_eq!(logits_for(&restored.model, &seq), logits_for(&model, &seq));
    }

    #[test]
    fn test_restore_rejects_bad_state() {
        let (tok, model) = tiny_model(&docs(&["ab"]), 4);
        let capture = || Checkpoint::capture(&model, &tok, Charset::Latin, &BTreeSet::new(), None);

        let mut narrow = capture();
        narrow.state_dict.get_mut("wte").unwrap()[1].pop();
        match narrow.restore() {
            Err(GptError::Shape { matrix, row, expected, got }) => {
                assert_eq!((matrix.as_str(), row, expected, got), ("wte", Some(1), 4, 3));
            }
            other => panic!("expected shape error, got {:?}", other.err()),
        }

        let mut missing = capture();
        missing.state_dict.remove("lm_head");
        assert!(matches!(missing.restore().err(), Some(GptError::MissingMatrix(n)) if n == "lm_head"));

        let mut version = capture();
        version.format_version = 2;
        assert!(matches!(version.restore().err(), Some(GptError::Checkpoint(_))));

        assert!(matches!(load_checkpoint(&temp_path("absent")), Err(GptError::NotFound(_))));
    }

    #[test]
    fn test_resume_matches_uninterrupted_run() {
        let d = docs(&["aba", "aab", "bb"]);
        let (tok, mut straight) = tiny_model(&d, 8);
        let mut full = Trainer::new(&d, &tok, &straight, train_cfg(4, 0.01)).unwrap();
        full.run(&mut straight).unwrap();

        let (_, mut first) = tiny_model(&d, 8);
        let mut half = Trainer::new(&d, &tok, &first, train_cfg(4, 0.01)).unwrap();
        half.step(&mut first).unwrap();
        half.step(&mut first).unwrap();
        let snap = half.adam.snapshot();

        let mut resumed = Model::from_state_dict(tiny_cfg(), tok.vocab_size, &first.state_dict()).unwrap();
        let mut rest = Trainer::new(&d, &tok, &resumed, train_cfg(4, 0.01)).unwrap().with_optimizer(snap).unwrap();
        assert_eq!(rest.steps_done(), 2);
        assert_eq!(rest.run(&mut resumed).unwrap().len(), 2);
        assert_eq!(resumed.state_dict(), straight.state_dict());
    }

    // ---- sampling ----

    #[test]
    fn test_samples_stay_within_bounds() {
        let (tok, model) = tiny_model(&docs(&["aba", "aab"]), 42);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..30 {
            let ids = sample_tokens(&model, &tok, 3, 0.5, &mut rng).unwrap();
            assert!(ids.len() <= 3);
            assert!(ids.iter().all(|&id| id < tok.bos));
        }
    }

    #[test]
    fn test_sample_config_validation() {
        let cfg = |num_samples, temperature, max_tokens| SampleConfig { num_samples, temperature, max_tokens };
        assert_eq!(cfg(1, 0.5, None).validate(16).unwrap(), 16);
        assert_eq!(cfg(1, 0.5, Some(100)).validate(16).unwrap(), 16);
        assert_eq!(cfg(1, 0.5, Some(5)).validate(16).unwrap(), 5);
        assert!(matches!(cfg(1, 0.0, None).validate(16), Err(GptError::Argument { name: "temperature", .. })));
        assert!(matches!(cfg(0, 0.5, None).validate(16), Err(GptError::Argument { name: "num_samples", .. })));
        assert!(matches!(cfg(1, 0.5, Some(0)).validate(16), Err(GptError::Argument { name: "max_tokens", .. })));
    }

    #[test]
    fn test_generation_is_seeded() {
        let d = docs(&["aba", "aab"]);
        let (tok, model) = tiny_model(&d, 42);
        let names: BTreeSet<String> = d.iter().cloned().collect();
        let cfg = SampleConfig { num_samples: 8, temperature: 0.7, max_tokens: None };
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            generate(&model, &tok, Charset::Latin, &names, &cfg, &mut rng).unwrap()
        };
        let a: Vec<String> = draw(1).into_iter().map(|s| s.text).collect();
        let b: Vec<String> = draw(1).into_iter().map(|s| s.text).collect();
        assert_eq!(a.len(), 8);
        assert_eq!(a, b);
        for s in draw(2) {
            assert_eq!(s.in_dataset, Some(names.contains(&s.text)));
        }
        let no_names = generate(&model, &tok, Charset::Latin, &BTreeSet::new(), &cfg, &mut StdRng::seed_from_u64(1)).unwrap();
        assert!(no_names.iter().all(|s| s.in_dataset.is_none()));
    }

    #[test]
    fn test_sample_lines_show_jamo_for_hangul() {
        let raw = Charset::Hangul.decompose("민수");
        let sample = Sample { text: Charset::Hangul.compose(&raw), raw: raw.clone(), in_dataset: Some(true) };
        assert_eq!(
            format_sample(0, &sample, Charset::Hangul),
            format!("sample  1: 민수 | in_dataset: true | jamo: {raw}")
        );
        let latin = Sample { raw: "ana".into(), text: "ana".into(), in_dataset: None };
        assert_eq!(format_sample(9, &latin, Charset::Latin), "sample 10: ana | in_dataset: N/A");
    }

    // ---- exports ----

    #[test]
    fn test_training_trace_records() {
        let d = docs(&["aba", "bab"]);
        let (tok, mut model) = tiny_model(&d, 42);
        let initial_pos0 = model.mats[WPE].data[0].clone();
        let mut trainer = Trainer::new(&d, &tok, &model, train_cfg(3, 0.01)).unwrap();
        let trace = record_training_trace(&mut model, &tok, Charset::Latin, &mut trainer, 8).unwrap();

        assert_eq!(trace.steps.len(), 4);
        assert_eq!(trace.step_options, vec![3]);
        let ids: Vec<&str> = trace.parameter_options.iter().map(|r| r.id.as_str()).collect();
        // 'e' is absent, so the head row falls back to the first unused char
        assert_eq!(ids, vec!["token_letter_a", "lm_head_letter_b", "position_0", "attn_wq_row_0"]);

        let first = &trace.steps[0];
        assert_eq!(first.loss, None);
        assert_eq!(first.params["position_0"].after, round_vec(&initial_pos0, 8));
        assert!(first.params.values().all(|p| p.grad.iter().all(|&g| g == 0.0)));

        let last = &trace.steps[3];
        assert_eq!(last.step, 3);
        assert!(last.loss.is_some());
        assert_eq!(last.params["attn_wq_row_0"].after, round_vec(&model.layer_mat(0, LayerMat::AttnWq).data[0], 8));
        assert!(trace.steps[1].params["token_letter_a"].grad.iter().any(|&g| g != 0.0));
    }

    #[test]
    fn test_hangul_tracked_rows_use_jamo_names() {
        let d: Vec<String> = ["민수", "서연"].iter().map(|n| Charset::Hangul.decompose(n)).collect();
        let tok = Tokenizer::from_docs(&d);
        let rows = resolve_tracked_rows(&tok, Charset::Hangul).unwrap();
        assert_eq!(rows[0].id, "token_choseong_ieung");
        assert_eq!(rows[0].token_char_display, Some('ㅇ'));
        assert_eq!(rows[1].id, "lm_head_choseong_sios");
        assert_eq!(rows[3].source, "layer0.attn_wq");
    }

    #[test]
    fn test_embedding_snapshot_shapes() {
        let (tok, model) = tiny_model(&docs(&["aba", "aab"]), 42);
        let snap = embedding_snapshot(&model, &tok);
        assert_eq!(snap.wte.len(), tok.vocab_size);
        assert_eq!(snap.wpe.len(), 4);
        assert_eq!(snap.attention.head_dim, 2);
        assert_eq!(snap.attention.attn_wq.len(), 4);
        assert_eq!(snap.mlp.mlp_fc1.len(), 16);
        assert_eq!(snap.mlp.mlp_fc2[0].len(), 16);
        assert_eq!(snap.tokenizer.bos, tok.bos);

        let path = temp_path("snapshot");
        write_json(&path, &snap).unwrap();
        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(json["attention"]["n_head"], 2);
        assert_eq!(json["tokenizer"]["uchars"][0], "a");
    }

    #[test]
    fn test_round_to_digits() {
        assert_eq!(round_to(0.123456789, 4), 0.1235);
        assert_eq!(round_to(-2.5e-9, 8), -0.0);
    }
}
