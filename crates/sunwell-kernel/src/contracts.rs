//! Tiered contract verification (§4.4): AST structural check, a compiler
//! type-check, and an optional semantic fallback. Grounded on
//! `contract_verifier.py`'s three-tier `verify()` cascade, reworked for a
//! Rust implementation language: `syn` replaces Python's own `ast` module
//! for Tier 1, and `cargo check` replaces `mypy` for Tier 2.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::process::run_command_with_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationTier {
    Ast,
    TypeCheck,
    Semantic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Passed,
    Failed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodMismatch {
    pub method_name: String,
    pub issue: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierResult {
    pub tier: VerificationTier,
    pub passed: bool,
    pub message: String,
    pub mismatches: Vec<MethodMismatch>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractVerificationResult {
    pub status: VerificationStatus,
    pub contract_name: String,
    pub implementation_file: String,
    pub contract_file: String,
    pub tier_results: Vec<TierResult>,
    pub final_tier: Option<VerificationTier>,
    pub error_message: Option<String>,
}

impl ContractVerificationResult {
    pub fn passed(&self) -> bool {
        self.status == VerificationStatus::Passed
    }
}

/// Extracted from a `syn::ItemTrait`: a method name plus its argument and
/// return type signature, compared structurally rather than textually.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MethodSignature {
    name: String,
    arg_types: Vec<String>,
    return_type: String,
}

fn trait_methods(source: &str, trait_name: &str) -> Result<Vec<MethodSignature>> {
    let file = syn::parse_file(source).context("failed to parse contract source")?;
    for item in &file.items {
        if let syn::Item::Trait(item_trait) = item
            && item_trait.ident == trait_name
        {
            return Ok(item_trait
                .items
                .iter()
                .filter_map(|ti| match ti {
                    syn::TraitItem::Fn(f) => Some(method_signature(&f.sig)),
                    _ => None,
                })
                .collect());
        }
    }
    anyhow::bail!("trait {trait_name} not found in contract source")
}

fn method_signature(sig: &syn::Signature) -> MethodSignature {
    let arg_types = sig
        .inputs
        .iter()
        .filter_map(|arg| match arg {
            syn::FnArg::Typed(pat_type) => Some(quote_type(&pat_type.ty)),
            syn::FnArg::Receiver(_) => None,
        })
        .collect();
    let return_type = match &sig.output {
        syn::ReturnType::Default => "()".to_string(),
        syn::ReturnType::Type(_, ty) => quote_type(ty),
    };
    MethodSignature { name: sig.ident.to_string(), arg_types, return_type }
}

fn quote_type(ty: &syn::Type) -> String {
    quote::quote!(#ty).to_string().replace(' ', "")
}

fn impl_methods(source: &str, impl_type_name: &str) -> Result<Vec<MethodSignature>> {
    let file = syn::parse_file(source).context("failed to parse implementation source")?;
    for item in &file.items {
        if let syn::Item::Impl(item_impl) = item
            && item_impl.trait_.is_none()
            && let syn::Type::Path(type_path) = item_impl.self_ty.as_ref()
            && type_path.path.segments.last().is_some_and(|s| s.ident == impl_type_name)
        {
            return Ok(item_impl
                .items
                .iter()
                .filter_map(|ii| match ii {
                    syn::ImplItem::Fn(f) => Some(method_signature(&f.sig)),
                    _ => None,
                })
                .collect());
        }
    }
    anyhow::bail!("no inherent impl block found for {impl_type_name}")
}

fn check_implementation_satisfies(required: &[MethodSignature], actual: &[MethodSignature]) -> Vec<MethodMismatch> {
    let mut mismatches = Vec::new();
    for req in required {
        match actual.iter().find(|m| m.name == req.name) {
            None => mismatches.push(MethodMismatch {
                method_name: req.name.clone(),
                issue: "method not implemented".into(),
                expected: Some(format!("fn {}({:?}) -> {}", req.name, req.arg_types, req.return_type)),
                actual: None,
            }),
            Some(found) if found.arg_types != req.arg_types || found.return_type != req.return_type => {
                mismatches.push(MethodMismatch {
                    method_name: req.name.clone(),
                    issue: "signature mismatch".into(),
                    expected: Some(format!("fn {}({:?}) -> {}", req.name, req.arg_types, req.return_type)),
                    actual: Some(format!("fn {}({:?}) -> {}", found.name, found.arg_types, found.return_type)),
                })
            }
            Some(_) => {}
        }
    }
    mismatches
}

/// A semantic fallback for cases Tier 1/2 can't resolve structurally
/// (default generic parameters, trait-object coercions the type checker
/// accepts but `syn` can't compare textually). Out of scope to wire an LLM
/// client here; callers provide their own.
pub trait SemanticVerifier {
    fn verify(&self, prompt: &str) -> Result<bool>;
}

pub struct NoSemanticVerifier;

impl SemanticVerifier for NoSemanticVerifier {
    fn verify(&self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}

pub struct ContractVerifier<'a> {
    pub workspace: PathBuf,
    pub skip_semantic: bool,
    pub type_check_timeout: Duration,
    pub semantic_verifier: &'a dyn SemanticVerifier,
}

impl<'a> ContractVerifier<'a> {
    pub fn new(workspace: PathBuf, skip_semantic: bool, type_check_timeout: Duration, semantic_verifier: &'a dyn SemanticVerifier) -> Self {
        Self { workspace, skip_semantic, type_check_timeout, semantic_verifier }
    }

    pub fn verify(&self, implementation_file: &Path, contract_file: &Path, contract_name: &str, impl_type_name: &str) -> Result<ContractVerificationResult> {
        let impl_path = self.resolve(implementation_file);
        let contract_path = self.resolve(contract_file);

        if !impl_path.exists() {
            return Ok(self.error_result(contract_name, &impl_path, &contract_path, format!("implementation file not found: {}", impl_path.display())));
        }
        if !contract_path.exists() {
            return Ok(self.error_result(contract_name, &impl_path, &contract_path, format!("contract file not found: {}", contract_path.display())));
        }

        let impl_source = std::fs::read_to_string(&impl_path).with_context(|| format!("failed to read {}", impl_path.display()))?;
        let contract_source = std::fs::read_to_string(&contract_path).with_context(|| format!("failed to read {}", contract_path.display()))?;

        let mut tier_results = Vec::new();

        let tier1 = self.run_ast_check(&impl_source, &contract_source, contract_name, impl_type_name);
        let tier1_passed = tier1.passed;
        let tier1_had_mismatches = !tier1.mismatches.is_empty();
        tier_results.push(tier1);

        if !tier1_passed && tier1_had_mismatches {
            return Ok(ContractVerificationResult {
                status: VerificationStatus::Failed,
                contract_name: contract_name.to_string(),
                implementation_file: impl_path.display().to_string(),
                contract_file: contract_path.display().to_string(),
                tier_results,
                final_tier: Some(VerificationTier::Ast),
                error_message: None,
            });
        }

        let tier2 = self.run_type_check(&impl_path);
        let tier2_passed = tier2.passed;
        tier_results.push(tier2);

        if tier2_passed {
            return Ok(ContractVerificationResult {
                status: VerificationStatus::Passed,
                contract_name: contract_name.to_string(),
                implementation_file: impl_path.display().to_string(),
                contract_file: contract_path.display().to_string(),
                tier_results,
                final_tier: Some(VerificationTier::TypeCheck),
                error_message: None,
            });
        }

        if !self.skip_semantic {
            let tier3 = self.run_semantic_check(&impl_source, &contract_source, contract_name, impl_type_name);
            let tier3_passed = tier3.passed;
            tier_results.push(tier3);
            if tier3_passed {
                return Ok(ContractVerificationResult {
                    status: VerificationStatus::Passed,
                    contract_name: contract_name.to_string(),
                    implementation_file: impl_path.display().to_string(),
                    contract_file: contract_path.display().to_string(),
                    tier_results,
                    final_tier: Some(VerificationTier::Semantic),
                    error_message: None,
                });
            }
        }

        let final_tier = tier_results.last().map(|t| t.tier);
        Ok(ContractVerificationResult {
            status: VerificationStatus::Failed,
            contract_name: contract_name.to_string(),
            implementation_file: impl_path.display().to_string(),
            contract_file: contract_path.display().to_string(),
            tier_results,
            final_tier,
            error_message: None,
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() { path.to_path_buf() } else { self.workspace.join(path) }
    }

    fn error_result(&self, contract_name: &str, impl_path: &Path, contract_path: &Path, message: String) -> ContractVerificationResult {
        ContractVerificationResult {
            status: VerificationStatus::Error,
            contract_name: contract_name.to_string(),
            implementation_file: impl_path.display().to_string(),
            contract_file: contract_path.display().to_string(),
            tier_results: Vec::new(),
            final_tier: None,
            error_message: Some(message),
        }
    }

    fn run_ast_check(&self, impl_source: &str, contract_source: &str, contract_name: &str, impl_type_name: &str) -> TierResult {
        let start = Instant::now();
        let required = match trait_methods(contract_source, contract_name) {
            Ok(m) => m,
            Err(e) => {
                return TierResult {
                    tier: VerificationTier::Ast,
                    passed: false,
                    message: format!("AST analysis failed: {e}"),
                    mismatches: Vec::new(),
                    duration_ms: start.elapsed().as_millis() as u64,
                };
            }
        };
        if required.is_empty() {
            return TierResult {
                tier: VerificationTier::Ast,
                passed: true,
                message: "contract has no required methods".into(),
                mismatches: Vec::new(),
                duration_ms: start.elapsed().as_millis() as u64,
            };
        }

        let actual = match impl_methods(impl_source, impl_type_name) {
            Ok(m) => m,
            Err(e) => {
                return TierResult {
                    tier: VerificationTier::Ast,
                    passed: false,
                    message: format!("AST analysis failed: {e}"),
                    mismatches: Vec::new(),
                    duration_ms: start.elapsed().as_millis() as u64,
                };
            }
        };

        let mismatches = check_implementation_satisfies(&required, &actual);
        let duration_ms = start.elapsed().as_millis() as u64;
        if mismatches.is_empty() {
            TierResult {
                tier: VerificationTier::Ast,
                passed: true,
                message: format!("all {} methods found with matching signatures", required.len()),
                mismatches,
                duration_ms,
            }
        } else {
            TierResult {
                tier: VerificationTier::Ast,
                passed: false,
                message: format!("found {} signature mismatch(es)", mismatches.len()),
                mismatches,
                duration_ms,
            }
        }
    }

    fn run_type_check(&self, impl_path: &Path) -> TierResult {
        let start = Instant::now();
        let out = run_command_with_timeout("cargo", &["check", "--message-format=short"], &self.workspace, self.type_check_timeout);
        let duration_ms = start.elapsed().as_millis() as u64;

        match out {
            Ok(output) if output.success() => TierResult {
                tier: VerificationTier::TypeCheck,
                passed: true,
                message: "cargo check passed".into(),
                mismatches: Vec::new(),
                duration_ms,
            },
            Ok(output) => {
                let impl_name = impl_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                let relevant: Vec<&str> = output.stderr.lines().filter(|l| l.contains(impl_name)).collect();
                if relevant.is_empty() {
                    TierResult {
                        tier: VerificationTier::TypeCheck,
                        passed: true,
                        message: "cargo check errors unrelated to this file ignored".into(),
                        mismatches: Vec::new(),
                        duration_ms,
                    }
                } else {
                    let mismatches = relevant
                        .iter()
                        .map(|line| MethodMismatch { method_name: "<type-error>".into(), issue: line.to_string(), expected: None, actual: None })
                        .collect::<Vec<_>>();
                    TierResult {
                        tier: VerificationTier::TypeCheck,
                        passed: false,
                        message: format!("cargo check found {} error(s)", mismatches.len()),
                        mismatches,
                        duration_ms,
                    }
                }
            }
            Err(e) => TierResult {
                tier: VerificationTier::TypeCheck,
                passed: false,
                message: format!("type check failed: {e}"),
                mismatches: Vec::new(),
                duration_ms,
            },
        }
    }

    fn run_semantic_check(&self, impl_source: &str, contract_source: &str, contract_name: &str, impl_type_name: &str) -> TierResult {
        let start = Instant::now();
        let prompt = format!(
            "Does `{impl_type_name}` satisfy the trait `{contract_name}`?\n\ntrait:\n{contract_source}\n\nimpl:\n{impl_source}"
        );
        let duration_ms_fn = || start.elapsed().as_millis() as u64;
        match self.semantic_verifier.verify(&prompt) {
            Ok(true) => TierResult {
                tier: VerificationTier::Semantic,
                passed: true,
                message: "semantic check determined the implementation satisfies the contract".into(),
                mismatches: Vec::new(),
                duration_ms: duration_ms_fn(),
            },
            Ok(false) => TierResult {
                tier: VerificationTier::Semantic,
                passed: false,
                message: "semantic check inconclusive or negative".into(),
                mismatches: Vec::new(),
                duration_ms: duration_ms_fn(),
            },
            Err(e) => TierResult {
                tier: VerificationTier::Semantic,
                passed: false,
                message: format!("semantic check failed: {e}"),
                mismatches: Vec::new(),
                duration_ms: duration_ms_fn(),
            },
        }
    }
}
