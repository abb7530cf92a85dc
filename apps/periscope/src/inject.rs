use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::Stream;

/// Upper bound on bytes held back while looking for an injection point.
/// Documents whose `</head>` / `<body>` sit deeper than this get the snippet
/// prepended instead.
pub const MAX_SCAN_WINDOW: usize = 64 * 1024;

/// Whether a response body should be rewritten at all.
pub fn should_inject(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("text/html")
}

/// Streaming body transformer that inserts `snippet` into an HTML document
/// exactly once: immediately before `</head>`, else right after the opening
/// `<body ...>` tag, else at the start of the document. Bytes are withheld
/// only until the insertion point is known (bounded by [`MAX_SCAN_WINDOW`]);
/// after that every chunk passes straight through. Upstream errors are
/// propagated verbatim, after flushing whatever was withheld.
pub struct InjectStream<S, E> {
    upstream: Pin<Box<S>>,
    snippet: Bytes,
    window: BytesMut,
    ready: VecDeque<Bytes>,
    deferred_error: Option<E>,
    injected: bool,
    upstream_done: bool,
}

// The inner stream is boxed and pinned once; no other field is structurally
// pinned.
impl<S, E> Unpin for InjectStream<S, E> {}

impl<S, E> InjectStream<S, E>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    pub fn new(upstream: S, snippet: &str) -> Self {
        Self {
            upstream: Box::pin(upstream),
            snippet: Bytes::copy_from_slice(snippet.as_bytes()),
            window: BytesMut::new(),
            ready: VecDeque::new(),
            deferred_error: None,
            injected: false,
            upstream_done: false,
        }
    }

    /// Splits the scan window at `at` and queues prefix + snippet + suffix.
    fn inject_at(&mut self, at: usize) {
        let buffered = self.window.split().freeze();
        if at > 0 {
            self.ready.push_back(buffered.slice(..at));
        }
        self.ready.push_back(self.snippet.clone());
        if at < buffered.len() {
            self.ready.push_back(buffered.slice(at..));
        }
        self.injected = true;
    }

    /// No usable tag: fall back to start-of-document.
    fn inject_prepended(&mut self) {
        self.ready.push_back(self.snippet.clone());
        if !self.window.is_empty() {
            let buffered = self.window.split().freeze();
            self.ready.push_back(buffered);
        }
        self.injected = true;
    }
}

impl<S, E> Stream for InjectStream<S, E>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(chunk) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(chunk)));
            }
            if let Some(err) = this.deferred_error.take() {
                this.upstream_done = true;
                return Poll::Ready(Some(Err(err)));
            }
            if this.upstream_done {
                return Poll::Ready(None);
            }

            match this.upstream.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    if this.injected {
                        if !chunk.is_empty() {
                            return Poll::Ready(Some(Ok(chunk)));
                        }
                        continue;
                    }
                    this.window.extend_from_slice(&chunk);
                    if let Some(at) = find_insertion(&this.window) {
                        this.inject_at(at);
                    } else if this.window.len() > MAX_SCAN_WINDOW {
                        this.inject_prepended();
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    if this.injected {
                        this.upstream_done = true;
                        return Poll::Ready(Some(Err(err)));
                    }
                    // Flush withheld bytes before surfacing the error, so the
                    // client sees exactly what the upstream produced.
                    if !this.window.is_empty() {
                        let buffered = this.window.split().freeze();
                        this.ready.push_back(buffered);
                    }
                    this.injected = true;
                    this.deferred_error = Some(err);
                }
                Poll::Ready(None) => {
                    this.upstream_done = true;
                    if !this.injected {
                        this.inject_prepended();
                    }
                }
            }
        }
    }
}

/// Offset at which the snippet belongs, if the window already contains a
/// usable tag: before the first `</head>`, else just past the `>` of the
/// first real `<body ...>` opener. Matching is ASCII case-insensitive.
fn find_insertion(buf: &[u8]) -> Option<usize> {
    if let Some(at) = find_ci(buf, b"</head>", 0) {
        return Some(at);
    }
    let mut from = 0;
    while let Some(at) = find_ci(buf, b"<body", from) {
        let rest = &buf[at + 5..];
        match rest.first() {
            Some(b'>') => return Some(at + 6),
            Some(c) if c.is_ascii_whitespace() || *c == b'/' => {
                // Tag end may still be in flight; wait for more bytes.
                return rest
                    .iter()
                    .position(|&b| b == b'>')
                    .map(|close| at + 5 + close + 1);
            }
            // Something like <bodyguard>; keep looking.
            Some(_) => from = at + 1,
            // `<body` is the last thing in the window so far.
            None => return None,
        }
    }
    None
}

fn find_ci(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < needle.len() + from {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
        .map(|at| at + from)
}
