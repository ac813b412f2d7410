use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pgguard-storage-operator")]
#[command(about = "Tiered disk-pressure remediation for managed PostgreSQL clusters")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// List Kubernetes resources (e.g. clusters)
    List {
        /// Resource type to list (clusters)
        resource: String,
    },

    /// Run a one-shot, read-only usage analysis across managed clusters
    Analyze,

    /// Manage the StorageGuardPolicy / StorageRemediationEvent CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Manage StorageGuardPolicy bundles and GitOps workflows
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Start the storage-guard operator reconcile loop
    Reconcile {
        #[command(subcommand)]
        action: ReconcileAction,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRD into the connected cluster
    Install,
}

#[derive(Subcommand)]
pub enum PolicyAction {
    /// List all available policy bundles
    BundleList,

    /// Show details of a specific bundle
    BundleShow {
        /// Bundle name (baseline, conservative, aggressive)
        name: String,
    },

    /// Generate a StorageGuardPolicy YAML from a bundle template
    BundleApply {
        /// Bundle name (baseline, conservative, aggressive)
        name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long, default_value = "storage-guard-policy")]
        policy_name: String,
    },

    /// Export StorageGuardPolicies from a namespace as YAML
    Export {
        #[arg(long, default_value = "default")]
        namespace: String,
    },

    /// Import StorageGuardPolicies from a YAML file
    Import {
        file: String,
        #[arg(long)]
        dry_run: bool,
    },

    /// Diff local YAML policies against cluster state
    Diff { file: String },
}

#[derive(Subcommand)]
pub enum ReconcileAction {
    /// Start the reconcile loop and metrics server
    Serve {
        #[arg(long, default_value = "0.0.0.0:9090")]
        addr: String,
    },
}
