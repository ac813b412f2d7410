use anyhow::Result;
use pgguard_storage_operator::bundles;
use pgguard_storage_operator::crd::StorageGuardPolicy;

/* ============================= BUNDLE COMMANDS ============================= */

/// List all available policy bundles.
pub fn bundle_list() -> Result<()> {
    let bundles = bundles::all_bundles();
    println!("{:<15} DESCRIPTION", "NAME");
    println!("{}", "-".repeat(70));
    for bundle in &bundles {
        println!("{:<15} {}", bundle.name, bundle.description);
    }
    Ok(())
}

/// Show details of a specific bundle.
pub fn bundle_show(name: &str) -> Result<()> {
    match bundles::get_bundle(name) {
        Some(bundle) => {
            println!("Bundle: {}", bundle.name);
            println!("Description: {}", bundle.description);
            println!();
            let yaml = serde_yaml::to_string(&bundle.spec)?;
            println!("Spec:");
            for line in yaml.lines() {
                println!("  {line}");
            }
            Ok(())
        }
        None => {
            let available: Vec<String> = bundles::all_bundles().iter().map(|b| b.name.clone()).collect();
            anyhow::bail!("Unknown bundle '{}'. Available bundles: {}", name, available.join(", "))
        }
    }
}

/// Generate a StorageGuardPolicy YAML from a bundle template.
///
/// The `selector` field is required but bundles don't know which clusters
/// a given deployment should match, so the emitted YAML carries an empty
/// selector with a comment pointing the operator at it.
pub fn bundle_apply(name: &str, namespace: &str, policy_name: &str) -> Result<()> {
    let bundle = bundles::get_bundle(name).ok_or_else(|| {
        let available: Vec<String> = bundles::all_bundles().iter().map(|b| b.name.clone()).collect();
        anyhow::anyhow!("Unknown bundle '{}'. Available bundles: {}", name, available.join(", "))
    })?;

    let spec_yaml = serde_yaml::to_string(&bundle.spec)?;
    let indented_spec: String = spec_yaml.lines().filter(|l| !l.is_empty()).map(|line| format!("  {line}")).collect::<Vec<_>>().join("\n");

    let output = format!(
        r#"apiVersion: storage.pgguard.io/v1
kind: StorageGuardPolicy
metadata:
  name: {policy_name}
  namespace: {namespace}
  labels:
    storage.pgguard.io/bundle: {bundle_name}
    app.kubernetes.io/managed-by: pgguard-storage-operator
spec:
{indented_spec}
"#,
        bundle_name = bundle.name,
    );

    print!("{output}");
    println!("# NOTE: fill in spec.selector with labels matching your managed clusters before applying.");
    Ok(())
}

/* ============================= GITOPS COMMANDS ============================= */

/// Export StorageGuardPolicies from a namespace as YAML.
pub async fn export(namespace: &str) -> Result<()> {
    let client = kube::Client::try_default().await?;
    let api: kube::Api<StorageGuardPolicy> = kube::Api::namespaced(client, namespace);
    let policies = api.list(&Default::default()).await?;

    if policies.items.is_empty() {
        println!("No StorageGuardPolicies found in namespace '{namespace}'");
        return Ok(());
    }

    let now = chrono::Utc::now().to_rfc3339();
    let mut first = true;
    for policy in &policies.items {
        if !first {
            println!("---");
        }
        first = false;

        let spec_yaml = serde_yaml::to_string(&policy.spec)?;
        let indented_spec: String = spec_yaml.lines().filter(|l| !l.is_empty()).map(|line| format!("  {line}")).collect::<Vec<_>>().join("\n");

        let name = policy.metadata.name.as_deref().unwrap_or("unnamed");
        let ns = policy.metadata.namespace.as_deref().unwrap_or(namespace);

        println!(
            r#"apiVersion: storage.pgguard.io/v1
kind: StorageGuardPolicy
metadata:
  name: {name}
  namespace: {ns}
  annotations:
    storage.pgguard.io/exported-at: "{now}"
    storage.pgguard.io/exported-from: "{ns}"
spec:
{indented_spec}"#
        );
    }

    Ok(())
}

/// Import StorageGuardPolicies from a YAML file.
pub async fn import(file: &str, dry_run: bool) -> Result<()> {
    let content = std::fs::read_to_string(file)?;
    let client = kube::Client::try_default().await?;

    for doc in content.split("---") {
        let trimmed = doc.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: serde_yaml::Value = serde_yaml::from_str(trimmed)?;
        let kind = value["kind"].as_str().unwrap_or("");
        if kind != "StorageGuardPolicy" {
            continue;
        }

        let policy: StorageGuardPolicy = serde_yaml::from_str(trimmed)?;
        let name = policy.metadata.name.as_deref().unwrap_or("unnamed");
        let ns = policy.metadata.namespace.as_deref().unwrap_or("default");

        if dry_run {
            println!("[DRY-RUN] Would apply StorageGuardPolicy '{name}' in namespace '{ns}'");
        } else {
            let api: kube::Api<StorageGuardPolicy> = kube::Api::namespaced(client.clone(), ns);
            match api.patch(name, &kube::api::PatchParams::apply("pgguard-storage-operator-cli"), &kube::api::Patch::Apply(&policy)).await {
                Ok(_) => println!("Applied StorageGuardPolicy '{name}' in namespace '{ns}'"),
                Err(e) => eprintln!("Failed to apply '{name}': {e}"),
            }
        }
    }

    Ok(())
}

/// Diff local YAML policies against cluster state.
pub async fn diff(file: &str) -> Result<()> {
    let content = std::fs::read_to_string(file)?;
    let client = kube::Client::try_default().await?;

    for doc in content.split("---") {
        let trimmed = doc.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: serde_yaml::Value = serde_yaml::from_str(trimmed)?;
        let kind = value["kind"].as_str().unwrap_or("");
        if kind != "StorageGuardPolicy" {
            continue;
        }

        let local_policy: StorageGuardPolicy = serde_yaml::from_str(trimmed)?;
        let name = local_policy.metadata.name.as_deref().unwrap_or("unnamed");
        let ns = local_policy.metadata.namespace.as_deref().unwrap_or("default");

        let api: kube::Api<StorageGuardPolicy> = kube::Api::namespaced(client.clone(), ns);
        match api.get(name).await {
            Ok(remote_policy) => {
                let local_json = serde_json::to_value(&local_policy.spec)?;
                let remote_json = serde_json::to_value(&remote_policy.spec)?;

                if local_json == remote_json {
                    println!("[=] {ns}/{name}: no changes");
                } else {
                    println!("[~] {ns}/{name}: spec differs");
                    diff_json("spec", &remote_json, &local_json, "  ");
                }
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                println!("[+] {ns}/{name}: new (not in cluster)");
            }
            Err(e) => {
                println!("[!] {ns}/{name}: error fetching from cluster: {e}");
            }
        }
    }

    Ok(())
}

fn diff_json(prefix: &str, remote: &serde_json::Value, local: &serde_json::Value, indent: &str) {
    match (remote, local) {
        (serde_json::Value::Object(r), serde_json::Value::Object(l)) => {
            for key in r.keys().chain(l.keys()).collect::<std::collections::BTreeSet<_>>() {
                let r_val = r.get(key);
                let l_val = l.get(key);
                match (r_val, l_val) {
                    (Some(rv), Some(lv)) if rv != lv => {
                        diff_json(&format!("{prefix}.{key}"), rv, lv, indent);
                    }
                    (Some(rv), None) => {
                        println!("{indent}- {prefix}.{key}: {rv}");
                    }
                    (None, Some(lv)) => {
                        println!("{indent}+ {prefix}.{key}: {lv}");
                    }
                    _ => {}
                }
            }
        }
        _ if remote != local => {
            println!("{indent}- {prefix}: {remote}");
            println!("{indent}+ {prefix}: {local}");
        }
        _ => {}
    }
}

/* ============================= TESTS ============================= */
