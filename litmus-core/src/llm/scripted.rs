//! Scripted provider returning canned completions
//!
//! Drives missions and evaluations deterministically: replies are matched by
//! a prompt substring first, then taken from a fallback queue. The last reply
//! of a queue repeats once the queue runs out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{LitmusError, Result};

use super::{LLMProvider, LLMRequest, LLMResponse, ModelInfo};

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Error(String),
}

#[derive(Debug)]
struct ReplyQueue {
    replies: Vec<Reply>,
    served: usize,
}

impl ReplyQueue {
    fn new() -> Self {
        Self {
            replies: Vec::new(),
            served: 0,
        }
    }

    fn next(&mut self) -> Option<Reply> {
        let reply = self
            .replies
            .get(self.served)
            .or_else(|| self.replies.last())
            .cloned();
        self.served += 1;
        reply
    }
}

#[derive(Debug)]
struct Rule {
    needle: String,
    queue: ReplyQueue,
}

/// Provider that answers from a script instead of a model
#[derive(Debug)]
pub struct ScriptedProvider {
    rules: Mutex<Vec<Rule>>,
    fallback: Mutex<ReplyQueue>,
    call_count: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            fallback: Mutex::new(ReplyQueue::new()),
            call_count: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply for prompts no rule matches
    pub fn then_reply(self, reply: impl Into<String>) -> Self {
        self.push_fallback(Reply::Text(reply.into()))
    }

    /// Queue a provider failure for prompts no rule matches
    pub fn then_error(self, message: impl Into<String>) -> Self {
        self.push_fallback(Reply::Error(message.into()))
    }

    /// Answer prompts containing `needle` with `replies`, in order
    pub fn when(self, needle: impl Into<String>, replies: &[&str]) -> Self {
        let replies = replies.iter().map(|r| Reply::Text(r.to_string())).collect();
        self.push_rule(needle.into(), replies)
    }

    /// Fail every prompt containing `needle`
    pub fn fail_when(self, needle: impl Into<String>, message: impl Into<String>) -> Self {
        self.push_rule(needle.into(), vec![Reply::Error(message.into())])
    }

    fn push_fallback(self, reply: Reply) -> Self {
        lock(&self.fallback).replies.push(reply);
        self
    }

    fn push_rule(self, needle: String, replies: Vec<Reply>) -> Self {
        lock(&self.rules).push(Rule {
            needle,
            queue: ReplyQueue {
                replies,
                served: 0,
            },
        });
        self
    }

    /// Number of completions requested so far
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Prompts received, in call order
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    /// Number of received prompts containing `needle`
    pub fn count_matching(&self, needle: &str) -> usize {
        lock(&self.prompts)
            .iter()
            .filter(|p| p.contains(needle))
            .count()
    }

    fn next_reply(&self, prompt: &str) -> Option<Reply> {
        let mut rules = lock(&self.rules);
        if let Some(rule) = rules.iter_mut().find(|r| prompt.contains(&r.needle)) {
            return rule.queue.next();
        }
        drop(rules);
        lock(&self.fallback).next()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn generate_request(&self, request: &LLMRequest) -> Result<LLMResponse> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let prompt = request.prompt().to_string();
        let reply = self.next_reply(&prompt);
        lock(&self.prompts).push(prompt);

        match reply {
            Some(Reply::Text(content)) => Ok(LLMResponse {
                content,
                usage: None,
            }),
            Some(Reply::Error(message)) => Err(LitmusError::Provider(message)),
            None => Err(LitmusError::Provider("no scripted reply".to_string())),
        }
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "scripted".to_string(),
            model_name: "none".to_string(),
        }
    }
}
