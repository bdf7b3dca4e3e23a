use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use conduit_dns_domain::DnsError;

use crate::context::QueryContext;
use crate::executable::{exec_chain, ChainNode, Executable, Matcher};

/// Conditional branch in the plugin graph.
///
/// Both subchains are built tail-first with their terminators linked to the
/// node's outer `next`, so a branch that falls through continues the outer
/// chain and a branch that short-circuits ends it. With no matcher the node
/// is a pass-through.
pub struct ConditionNode {
    matcher: Option<Arc<dyn Matcher>>,
    then_chain: Option<Arc<ChainNode>>,
    else_chain: Option<Arc<ChainNode>>,
}

impl ConditionNode {
    pub fn new(
        matcher: Option<Arc<dyn Matcher>>,
        then_chain: Option<Arc<ChainNode>>,
        else_chain: Option<Arc<ChainNode>>,
    ) -> Self {
        Self {
            matcher,
            then_chain,
            else_chain,
        }
    }
}

#[async_trait]
impl Executable for ConditionNode {
    async fn exec(
        &self,
        qctx: &mut QueryContext,
        next: Option<&Arc<ChainNode>>,
    ) -> Result<(), DnsError> {
        if let Some(matcher) = &self.matcher {
            let matched = matcher.matches(qctx).await.map_err(|e| DnsError::Plugin {
                plugin: "if".to_string(),
                detail: e.to_string(),
            })?;

            if matched && self.then_chain.is_some() {
                return exec_chain(qctx, self.then_chain.as_ref()).await;
            }
            if !matched && self.else_chain.is_some() {
                return exec_chain(qctx, self.else_chain.as_ref()).await;
            }
        }

        exec_chain(qctx, next).await
    }
}

/// Boolean expression over named matchers: `!`, `&&`, `||` and parentheses,
/// e.g. `"qtype_aaaa && !domestic"`.
///
/// Variables are resolved against the registry once at build time, so an
/// unknown name is a construction error, not a per-query one. Evaluation
/// short-circuits; each variable that did run has its result recorded for
/// the debug log.
pub struct ExprMatcher {
    source: String,
    expr: Expr,
    matchers: Vec<(String, Arc<dyn Matcher>)>,
}

enum Expr {
    Var(usize),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl ExprMatcher {
    pub fn compile(
        source: &str,
        registry: &HashMap<String, Arc<dyn Matcher>>,
    ) -> Result<Self, DnsError> {
        let tokens = tokenize(source)?;
        let mut matchers: Vec<(String, Arc<dyn Matcher>)> = Vec::new();
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
        };
        let expr = parser.parse_or(registry, &mut matchers)?;
        if parser.pos != tokens.len() {
            return Err(DnsError::Config(format!(
                "trailing input in expression '{}'",
                source
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
            matchers,
        })
    }

    fn eval<'a>(
        &'a self,
        expr: &'a Expr,
        qctx: &'a QueryContext,
        seen: &'a mut Vec<(usize, bool)>,
    ) -> BoxFuture<'a, Result<bool, DnsError>> {
        Box::pin(async move {
            match expr {
                Expr::Var(i) => {
                    let res = self.matchers[*i].1.matches(qctx).await?;
                    seen.push((*i, res));
                    Ok(res)
                }
                Expr::Not(inner) => Ok(!self.eval(inner, qctx, seen).await?),
                Expr::And(a, b) => {
                    if !self.eval(a, qctx, seen).await? {
                        return Ok(false);
                    }
                    self.eval(b, qctx, seen).await
                }
                Expr::Or(a, b) => {
                    if self.eval(a, qctx, seen).await? {
                        return Ok(true);
                    }
                    self.eval(b, qctx, seen).await
                }
            }
        })
    }
}

#[async_trait]
impl Matcher for ExprMatcher {
    async fn matches(&self, qctx: &QueryContext) -> Result<bool, DnsError> {
        // Per-invocation result buffer; nothing carries over between queries.
        let mut seen: Vec<(usize, bool)> = Vec::new();
        let result = self.eval(&self.expr, qctx, &mut seen).await?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            let vars: Vec<String> = seen
                .iter()
                .map(|(i, v)| format!("{}={}", self.matchers[*i].0, v))
                .collect();
            debug!(
                expr = %self.source,
                result,
                vars = %vars.join(" "),
                query = %qctx.summary(),
                "condition evaluated"
            );
        }

        Ok(result)
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Ident(String),
    Not,
    And,
    Or,
    Open,
    Close,
}

fn tokenize(s: &str) -> Result<Vec<Token>, DnsError> {
    let bytes = s.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' => i += 1,
            b'!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            b'(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            b')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            b'&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            b'|' if bytes.get(i + 1) == Some(&b'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            c if c.is_ascii_alphanumeric() || c == b'_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(s[start..i].to_string()));
            }
            c => {
                return Err(DnsError::Config(format!(
                    "unexpected character '{}' in expression '{}'",
                    c as char, s
                )))
            }
        }
    }
    if tokens.is_empty() {
        return Err(DnsError::Config("empty expression".to_string()));
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse_or(
        &mut self,
        registry: &HashMap<String, Arc<dyn Matcher>>,
        matchers: &mut Vec<(String, Arc<dyn Matcher>)>,
    ) -> Result<Expr, DnsError> {
        let mut left = self.parse_and(registry, matchers)?;
        while self.tokens.get(self.pos) == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and(registry, matchers)?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(
        &mut self,
        registry: &HashMap<String, Arc<dyn Matcher>>,
        matchers: &mut Vec<(String, Arc<dyn Matcher>)>,
    ) -> Result<Expr, DnsError> {
        let mut left = self.parse_unary(registry, matchers)?;
        while self.tokens.get(self.pos) == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary(registry, matchers)?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(
        &mut self,
        registry: &HashMap<String, Arc<dyn Matcher>>,
        matchers: &mut Vec<(String, Arc<dyn Matcher>)>,
    ) -> Result<Expr, DnsError> {
        match self.tokens.get(self.pos) {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.parse_unary(registry, matchers)?)))
            }
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.parse_or(registry, matchers)?;
                if self.tokens.get(self.pos) != Some(&Token::Close) {
                    return Err(DnsError::Config("unbalanced parenthesis".to_string()));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                if let Some(i) = matchers.iter().position(|(n, _)| n == name) {
                    return Ok(Expr::Var(i));
                }
                let m = registry.get(name).ok_or_else(|| {
                    DnsError::Config(format!("cannot find matcher '{}'", name))
                })?;
                matchers.push((name.clone(), Arc::clone(m)));
                Ok(Expr::Var(matchers.len() - 1))
            }
            _ => Err(DnsError::Config("expected matcher name".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{RequestMeta, TransportProtocol};
    use hickory_proto::op::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(bool, Arc<AtomicUsize>);

    #[async_trait]
    impl Matcher for Fixed {
        async fn matches(&self, _qctx: &QueryContext) -> Result<bool, DnsError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(self.0)
        }
    }

    fn registry(entries: &[(&str, bool)]) -> (HashMap<String, Arc<dyn Matcher>>, Vec<Arc<AtomicUsize>>) {
        let mut reg: HashMap<String, Arc<dyn Matcher>> = HashMap::new();
        let mut counters = Vec::new();
        for (name, val) in entries {
            let counter = Arc::new(AtomicUsize::new(0));
            counters.push(Arc::clone(&counter));
            reg.insert(name.to_string(), Arc::new(Fixed(*val, counter)));
        }
        (reg, counters)
    }

    fn ctx() -> QueryContext {
        QueryContext::new(
            Message::new(),
            RequestMeta::unknown_client(TransportProtocol::Udp),
        )
    }

    #[tokio::test]
    async fn evaluates_precedence() {
        let (reg, _) = registry(&[("a", true), ("b", false), ("c", true)]);
        // && binds tighter than ||
        let m = ExprMatcher::compile("a && b || c", &reg).unwrap();
        assert!(m.matches(&ctx()).await.unwrap());

        let m = ExprMatcher::compile("a && (b || c)", &reg).unwrap();
        assert!(m.matches(&ctx()).await.unwrap());

        let m = ExprMatcher::compile("!a || b", &reg).unwrap();
        assert!(!m.matches(&ctx()).await.unwrap());
    }

    #[tokio::test]
    async fn short_circuit_skips_right_side() {
        let (reg, counters) = registry(&[("lhs", false), ("rhs", true)]);
        let m = ExprMatcher::compile("lhs && rhs", &reg).unwrap();
        assert!(!m.matches(&ctx()).await.unwrap());
        assert_eq!(counters[0].load(Ordering::SeqCst), 1);
        assert_eq!(counters[1].load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_variable_is_a_build_error() {
        let (reg, _) = registry(&[("known", true)]);
        assert!(ExprMatcher::compile("known && missing", &reg).is_err());
    }

    #[test]
    fn rejects_garbage() {
        let (reg, _) = registry(&[("a", true)]);
        assert!(ExprMatcher::compile("a &&", &reg).is_err());
        assert!(ExprMatcher::compile("(a", &reg).is_err());
        assert!(ExprMatcher::compile("a ^ a", &reg).is_err());
        assert!(ExprMatcher::compile("", &reg).is_err());
    }

    #[tokio::test]
    async fn condition_node_runs_then_branch() {
        struct SetMark(u32);

        #[async_trait]
        impl Executable for SetMark {
            async fn exec(
                &self,
                qctx: &mut QueryContext,
                next: Option<&Arc<ChainNode>>,
            ) -> Result<(), DnsError> {
                qctx.add_mark(self.0);
                exec_chain(qctx, next).await
            }
        }

        let (reg, _) = registry(&[("yes", true)]);
        let matcher: Arc<dyn Matcher> = Arc::new(ExprMatcher::compile("yes", &reg).unwrap());

        let tail = ChainNode::link(&[Arc::new(SetMark(99)) as Arc<dyn Executable>], None);
        let then_chain = ChainNode::link(&[Arc::new(SetMark(1)) as Arc<dyn Executable>], tail.clone());
        let else_chain = ChainNode::link(&[Arc::new(SetMark(2)) as Arc<dyn Executable>], tail.clone());

        let node = ConditionNode::new(Some(matcher), then_chain, else_chain);
        let mut qctx = ctx();
        node.exec(&mut qctx, tail.as_ref()).await.unwrap();

        assert!(qctx.has_mark(1));
        assert!(!qctx.has_mark(2));
        // The then-branch terminator is linked to the outer next.
        assert!(qctx.has_mark(99));
    }
}
