//! Line-oriented control files.
//!
//! A `ctl` file accepts one command per write: the first whitespace-
//! delimited token is the verb, the remainder the argument. Reading a `ctl`
//! returns a `key value` status line per entry. Verbs that produce output
//! (`export`) leave a pending response which the next read at offset 0
//! consumes in place of the status, the usual read-after-write convention
//! for control files.

use {
    crate::{
        error::Result,
        node::{self, FileOps},
        usage,
    },
    async_trait::async_trait,
    std::{collections::HashMap, sync::Mutex},
};

/// Command target behind a [`CtlFile`].
#[async_trait]
pub trait CtlHandler: Send + Sync {
    /// Execute a verb. `Ok(Some(text))` queues `text` as the next read's
    /// content. Unknown verbs must fail with a usage error.
    async fn command(&self, verb: &str, arg: &str) -> Result<Option<String>>;

    /// Key/value pairs for the status read.
    async fn status(&self) -> Vec<(String, String)>;
}

pub struct CtlFile {
    handler: Box<dyn CtlHandler>,
    pending: Mutex<Option<String>>,
    cache: Mutex<HashMap<u32, Vec<u8>>>,
}

impl CtlFile {
    pub fn new(handler: impl CtlHandler + 'static) -> CtlFile {
        CtlFile {
            handler: Box::new(handler),
            pending: Mutex::new(None),
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn build(&self) -> Vec<u8> {
        if let Some(resp) = self.pending.lock().unwrap().take() {
            return resp.into_bytes();
        }
        let mut out = String::new();
        for (key, value) in self.handler.status().await {
            out.push_str(&key);
            out.push(' ');
            out.push_str(&value);
            out.push('\n');
        }
        out.into_bytes()
    }
}

/// Split a command line into verb and argument.
pub fn split_command(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match line.split_once(char::is_whitespace) {
        Some((verb, arg)) => Some((verb, arg.trim())),
        None => Some((line, "")),
    }
}

#[async_trait]
impl FileOps for CtlFile {
    async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let cached = if offset == 0 {
            None
        } else {
            self.cache.lock().unwrap().get(&fid).cloned()
        };
        let content = match cached {
            Some(c) => c,
            None => {
                let c = self.build().await;
                self.cache.lock().unwrap().insert(fid, c.clone());
                c
            }
        };
        Ok(node::slice_at(&content, offset, count))
    }

    async fn write(&self, _fid: u32, _offset: u64, data: &[u8]) -> Result<u32> {
        let line = String::from_utf8_lossy(data);
        let (verb, arg) =
            split_command(&line).ok_or_else(|| usage!("empty control command"))?;
        if let Some(resp) = self.handler.command(verb, arg).await? {
            *self.pending.lock().unwrap() = Some(resp);
        }
        Ok(data.len() as u32)
    }

    async fn clunk(&self, fid: u32) {
        self.cache.lock().unwrap().remove(&fid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter {
        hits: AtomicU32,
    }

    #[async_trait]
    impl CtlHandler for Counter {
        async fn command(&self, verb: &str, arg: &str) -> Result<Option<String>> {
            match verb {
                "bump" => {
                    self.hits.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
                "export" => Ok(Some(format!("payload {arg}"))),
                _ => Err(usage!("unknown verb '{verb}'")),
            }
        }

        async fn status(&self) -> Vec<(String, String)> {
            vec![("hits".into(), self.hits.load(Ordering::SeqCst).to_string())]
        }
    }

    fn ctl() -> CtlFile {
        CtlFile::new(Counter {
            hits: AtomicU32::new(0),
        })
    }

    #[test]
    fn split_command_takes_first_token() {
        assert_eq!(split_command("size 800 600\n"), Some(("size", "800 600")));
        assert_eq!(split_command("refresh"), Some(("refresh", "")));
        assert_eq!(split_command("  \n"), None);
    }

    #[tokio::test]
    async fn status_read_is_key_value_lines() {
        let f = ctl();
        f.write(1, 0, b"bump\n").await.unwrap();
        f.write(1, 0, b"bump\n").await.unwrap();
        assert_eq!(f.read(2, 0, 4096).await.unwrap(), b"hits 2\n");
    }

    #[tokio::test]
    async fn unknown_verb_is_usage() {
        let f = ctl();
        assert!(matches!(
            f.write(1, 0, b"frobnicate\n").await,
            Err(Error::Usage(_))
        ));
    }

    #[tokio::test]
    async fn command_response_is_consumed_by_next_read() {
        let f = ctl();
        f.write(1, 0, b"export all").await.unwrap();
        assert_eq!(f.read(2, 0, 4096).await.unwrap(), b"payload all");
        // Consumed: the following read is plain status again.
        assert_eq!(f.read(3, 0, 4096).await.unwrap(), b"hits 0\n");
    }

    #[tokio::test]
    async fn continuation_reads_use_the_fid_cache() {
        let f = ctl();
        f.write(1, 0, b"export abc").await.unwrap();
        assert_eq!(f.read(2, 0, 4).await.unwrap(), b"payl");
        assert_eq!(f.read(2, 4, 4096).await.unwrap(), b"oad abc");
        f.clunk(2).await;
    }
}
