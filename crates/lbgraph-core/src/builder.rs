// The entry point for every domain event.
//
// An ingress update is applied in three phases:
//
// 1. Plan. Work out where every host on the ingress belongs (which model,
//    which virtual service, secure or not) and record it in the ingress host
//    cache, getting back whatever was recorded last time.
//
// 2. Tear down. Any host that moved since the last update is removed from its
//    old placement entirely before anything new is built. Hosts that stayed
//    put only lose the paths that went away. Teardown has to finish first: a
//    host moving between two placements in the same model must not have its
//    new build undone by its old teardown.
//
// 3. Build and publish. Every host is built into its new placement, and every
//    model touched by either phase goes through the publish gate. A model
//    whose virtual service no longer serves anything is tombstoned, unless
//    it's a dedicated virtual service some ingress still places a host on.
//
// Graphs are mutated one at a time, each under its own lock. Every event
// touching a model gets the model's one graph from the store.

use std::collections::BTreeMap;
use std::sync::Arc;

use lbgraph_api::{Config, HostPath, IngressSpec, K8sNode, L4Service, TlsSettings};

use crate::cache::{Caches, HostMode, HostRecord, PathRecord};
use crate::graph::{GraphNodes, ObjectGraph};
use crate::hierarchy::{BuildContext, IngressRef};
use crate::naming::Naming;
use crate::nodes::{VirtualServiceNode, VrfNode};
use crate::shard::{ParentVs, Sharding};
use crate::store::GraphStore;
use crate::vrf::VrfReconciler;
use crate::{Error, ObjectLister, Result};

/// Builds and maintains object graphs from domain events.
///
/// A builder owns a [GraphStore] and the relationship [Caches]. Every method
/// takes `&self`, so a single builder can be shared between threads that
/// process independent events.
#[derive(Debug)]
pub struct GraphBuilder<L> {
    config: Config,
    naming: Naming,
    sharding: Sharding,
    lister: L,
    store: Arc<GraphStore>,
    caches: Arc<Caches>,
}

enum HostBuild<'s> {
    Insecure {
        paths: &'s [HostPath],
    },
    Secure {
        tls: &'s TlsSettings,
        paths: &'s [HostPath],
    },
    Passthrough {
        backends: &'s [HostPath],
        redirect: bool,
    },
}

struct HostPlan<'s> {
    record: HostRecord,
    build: HostBuild<'s>,
}

// the graphs touched by a single event, by model name
type Touched = BTreeMap<String, Arc<ObjectGraph>>;

impl<L: ObjectLister> GraphBuilder<L> {
    /// Create a builder with an empty store.
    pub fn new(config: Config, lister: L) -> Self {
        let store = Arc::new(GraphStore::new(config.retry_count));
        Self::with_store(config, lister, store, Arc::new(Caches::default()))
    }

    /// Create a builder that shares a store and caches with something else,
    /// usually a publisher.
    pub fn with_store(
        config: Config,
        lister: L,
        store: Arc<GraphStore>,
        caches: Arc<Caches>,
    ) -> Self {
        let naming = Naming::new(&config);
        let sharding = Sharding::new(&config);
        Self {
            config,
            naming,
            sharding,
            lister,
            store,
            caches,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn caches(&self) -> &Arc<Caches> {
        &self.caches
    }

    pub fn lister(&self) -> &L {
        &self.lister
    }

    pub fn lister_mut(&mut self) -> &mut L {
        &mut self.lister
    }

    fn context<'a>(&'a self, key: &'a str) -> BuildContext<'a, L> {
        BuildContext {
            key,
            config: &self.config,
            naming: &self.naming,
            lister: &self.lister,
            caches: &self.caches,
        }
    }

    /// Build or rebuild every host on an ingress or route.
    ///
    /// Returns the names of the models that changed and need to be published,
    /// including models that were tombstoned. An invalid ingress is logged
    /// and leaves every model as it was.
    pub fn upsert_ingress(&self, key: &str, ingress: &IngressSpec) -> Vec<String> {
        if let Err(e) = ingress.validate() {
            tracing::warn!(key, ingress = %ingress.key(), err = %e, "invalid ingress, skipping");
            return Vec::new();
        }

        let ctx = self.context(key);
        let ing_key = ingress.key();
        let plans = self.plan(key, ingress);

        let records = plans
            .iter()
            .map(|(host, plan)| (host.clone(), plan.record.clone()))
            .collect();
        let previous = self.caches.ingress_hosts.replace(&ing_key, records);

        let mut touched = Touched::new();
        for (host, old) in &previous {
            let current = plans
                .get(host)
                .map(|p| &p.record)
                .filter(|r| r.same_placement(old));
            let moved = current.is_none();
            let removed: Vec<_> = match current {
                Some(record) => old
                    .paths
                    .iter()
                    .filter(|p| !record.paths.contains(p))
                    .cloned()
                    .collect(),
                None => old.paths.clone(),
            };

            // passthrough hosts are rebuilt wholesale in place
            if !moved && (removed.is_empty() || old.mode == HostMode::Passthrough) {
                continue;
            }
            tracing::debug!(key, %host, model = %old.model_name, moved, paths = removed.len(), "tearing down host");
            self.teardown_host(&ctx, &mut touched, ingress, host, old, &removed);
        }

        for (host, plan) in &plans {
            if let Err(err) = self.build_host(&ctx, &mut touched, ingress, host, plan) {
                tracing::warn!(
                    key,
                    %host,
                    model = %plan.record.model_name,
                    retry = err.is_missing_dependency(),
                    %err,
                    "failed to build host"
                );
            }
        }

        self.caches.secrets.remove_ingress(&ing_key);
        for tls in &ingress.tls {
            if !tls.secret_name.is_empty() {
                let namespace = tls.secret_namespace.as_deref().unwrap_or(&ingress.namespace);
                let secret_key = format!("{namespace}/{}", tls.secret_name);
                self.caches.secrets.add(&secret_key, &ing_key);
            }
        }

        self.publish(key, touched)
    }

    /// Remove every host an ingress or route contributed.
    ///
    /// Returns the names of the models that changed or were tombstoned.
    pub fn delete_ingress(&self, key: &str, namespace: &str, name: &str) -> Vec<String> {
        let ctx = self.context(key);
        let ing_key = format!("{namespace}/{name}");

        let previous = self.caches.ingress_hosts.remove(&ing_key);
        if previous.is_empty() {
            tracing::debug!(key, ingress = %ing_key, "no hosts recorded for ingress");
        }

        let mut touched = Touched::new();
        for (host, old) in &previous {
            let ing = IngressRef::from_record(namespace, name, old);
            self.teardown(&ctx, &mut touched, &ing, host, old, &old.paths);
        }
        self.caches.secrets.remove_ingress(&ing_key);

        self.publish(key, touched)
    }

    /// Build or rebuild the L4 virtual service for a LoadBalancer service.
    /// Returns the model's name if it changed. An invalid service is logged
    /// and leaves the model as it was.
    pub fn upsert_service(&self, key: &str, svc: &L4Service) -> Option<String> {
        if let Err(e) = svc.validate() {
            tracing::warn!(key, service = %svc.key(), err = %e, "invalid service, skipping");
            return None;
        }

        let vs = self.context(key).build_l4_vs(svc);
        let model = self.naming.model_name(&vs.name);
        let graph = self.store.get_or_create(&model, || ObjectGraph::new(&model));

        let changed = graph.update(|nodes| {
            nodes.clear();
            nodes.push(vs);
            self.store.commit(&model, &graph, nodes.checksum())
        });
        changed.then_some(model)
    }

    /// Remove the L4 virtual service for a service that was deleted or is
    /// no longer a LoadBalancer. Returns the model's name if it was
    /// tombstoned.
    pub fn delete_service(&self, key: &str, namespace: &str, name: &str) -> Option<String> {
        let model = self
            .naming
            .model_name(&self.naming.l4_vs_name(namespace, name));
        self.remove_model(key, &model).then_some(model)
    }

    /// Add or update a node's static routes. Returns the VRF model's name if
    /// it changed.
    pub fn upsert_node(&self, key: &str, node: K8sNode) -> Option<String> {
        if self.config.disable_static_routes {
            tracing::trace!(key, node = %node.name, "static routes disabled");
            return None;
        }

        self.caches.nodes.insert(node.clone());
        let model = self.naming.model_name(&self.config.vrf_name);
        let graph = self
            .store
            .get_or_create(&model, || ObjectGraph::new_vrf(&model));
        let reconciler = VrfReconciler::new(&self.naming, key);

        let changed = graph.update(|nodes| {
            if nodes.vrf().is_none() {
                nodes.push(VrfNode::new(&self.config.vrf_name));
            }
            if let Some(vrf) = nodes.vrf_mut() {
                reconciler.upsert_node(vrf, &node, &self.caches.nodes);
            }
            self.store.commit(&model, &graph, nodes.checksum())
        });
        changed.then_some(model)
    }

    /// Remove a node's static routes. Returns the VRF model's name if it
    /// changed.
    pub fn delete_node(&self, key: &str, name: &str) -> Option<String> {
        if self.config.disable_static_routes {
            tracing::trace!(key, node = name, "static routes disabled");
            return None;
        }

        if self.caches.nodes.remove(name).is_none() {
            let err = Error::NodeNotFound(name.to_string());
            tracing::debug!(key, %err, "removing static routes for unknown node");
        }
        let model = self.naming.model_name(&self.config.vrf_name);
        let Some(graph) = self.store.get(&model) else {
            tracing::debug!(key, %model, "no VRF model, nothing to remove");
            return None;
        };
        let reconciler = VrfReconciler::new(&self.naming, key);

        let changed = graph.update(|nodes| {
            if let Some(vrf) = nodes.vrf_mut() {
                reconciler.delete_node(vrf, name, &self.caches.nodes);
            }
            self.store.commit(&model, &graph, nodes.checksum())
        });
        changed.then_some(model)
    }

    /// Tombstone a model and drop everything in it, so the next event that
    /// touches it builds it from scratch. Returns `true` if there was a live
    /// graph to tombstone.
    pub fn remove_model(&self, key: &str, model: &str) -> bool {
        let Some(graph) = self.store.get_shared(model) else {
            tracing::debug!(key, model, "no such model");
            return false;
        };

        let live = graph.update(|nodes| {
            nodes.clear();
            self.store.retire(model, &graph)
        });
        tracing::info!(key, model, live, "removed model");
        live
    }

    // Work out where every host on an ingress goes. A host can only be placed
    // once: secure beats insecure, and passthrough loses to both.
    fn plan<'s>(&self, key: &str, ingress: &'s IngressSpec) -> BTreeMap<String, HostPlan<'s>> {
        let mut plans = BTreeMap::new();

        for tls in &ingress.tls {
            let secret = (!tls.secret_name.is_empty()).then(|| tls.secret_name.clone());
            for (host, paths) in &tls.hosts {
                if plans.contains_key(host) {
                    tracing::warn!(key, %host, "host listed in more than one TLS block, skipping");
                    continue;
                }
                let parent = self.sharding.parent_vs(ingress, host);
                let record = self.record(ingress, HostMode::Secure, parent, paths, secret.clone(), tls.redirect);
                plans.insert(host.clone(), HostPlan {
                    record,
                    build: HostBuild::Secure { tls, paths },
                });
            }
        }

        for (host, paths) in &ingress.hosts {
            if plans.contains_key(host) {
                tracing::debug!(key, %host, "host is secure, ignoring insecure paths");
                continue;
            }
            let parent = self.sharding.parent_vs(ingress, host);
            let record = self.record(ingress, HostMode::Insecure, parent, paths, None, false);
            plans.insert(host.clone(), HostPlan {
                record,
                build: HostBuild::Insecure { paths },
            });
        }

        for (host, passthrough) in &ingress.passthrough {
            if plans.contains_key(host) {
                tracing::warn!(key, %host, "host is already terminated, ignoring passthrough");
                continue;
            }
            let parent = self
                .sharding
                .passthrough_vs(ingress.infra_setting_name(), host);
            let mut record = self.record(
                ingress,
                HostMode::Passthrough,
                parent,
                &passthrough.backends,
                None,
                passthrough.redirect,
            );
            for p in &mut record.paths {
                p.path.clear();
            }
            plans.insert(host.clone(), HostPlan {
                record,
                build: HostBuild::Passthrough {
                    backends: &passthrough.backends,
                    redirect: passthrough.redirect,
                },
            });
        }

        plans
    }

    fn record(
        &self,
        ingress: &IngressSpec,
        mode: HostMode,
        parent: ParentVs,
        paths: &[HostPath],
        secret: Option<String>,
        redirect: bool,
    ) -> HostRecord {
        let mut paths: Vec<_> = paths
            .iter()
            .map(|p| PathRecord {
                path: p.path.clone(),
                service: p.service_name.clone(),
            })
            .collect();
        paths.sort();
        paths.dedup();

        HostRecord {
            mode,
            kind: ingress.kind,
            model_name: parent.model_name,
            vs_name: parent.vs_name,
            dedicated: parent.dedicated,
            infra_setting: ingress.infra_setting_name().map(str::to_string),
            paths,
            secret,
            redirect,
        }
    }

    // Find a graph that's already been touched by this event, or the graph
    // the store has for the model.
    fn existing_graph(&self, touched: &mut Touched, model: &str) -> Option<Arc<ObjectGraph>> {
        if let Some(graph) = touched.get(model) {
            return Some(graph.clone());
        }
        let graph = self.store.get_shared(model)?;
        touched.insert(model.to_string(), graph.clone());
        Some(graph)
    }

    // Find or create the graph a host record belongs in. The graph always
    // comes from the store, so every event building into the same model
    // shares it.
    fn graph_for(
        &self,
        ctx: &BuildContext<'_, L>,
        touched: &mut Touched,
        record: &HostRecord,
    ) -> Arc<ObjectGraph> {
        let model = &record.model_name;
        if let Some(graph) = touched.get(model) {
            return graph.clone();
        }

        let graph = self
            .store
            .get_or_create(model, || ObjectGraph::new(model));
        graph.update(|nodes| {
            if nodes.virtual_service().is_some() {
                return;
            }
            let vs = match record.mode {
                HostMode::Passthrough => {
                    ctx.construct_passthrough_vs(&record.vs_name, record.infra_setting.as_deref())
                }
                _ if record.dedicated => ctx.construct_dedicated_vs(&record.vs_name),
                _ => ctx.construct_shared_vs(&record.vs_name, self.sharding.is_evh()),
            };
            tracing::debug!(key = %ctx.key, %model, "creating virtual service");
            nodes.push(vs);
        });
        touched.insert(model.clone(), graph.clone());
        graph
    }

    fn teardown_host(
        &self,
        ctx: &BuildContext<'_, L>,
        touched: &mut Touched,
        ingress: &IngressSpec,
        host: &str,
        old: &HostRecord,
        paths: &[PathRecord],
    ) {
        let ing = IngressRef::from_record(&ingress.namespace, &ingress.name, old);
        self.teardown(ctx, touched, &ing, host, old, paths);
    }

    fn teardown(
        &self,
        ctx: &BuildContext<'_, L>,
        touched: &mut Touched,
        ing: &IngressRef,
        host: &str,
        old: &HostRecord,
        paths: &[PathRecord],
    ) {
        let Some(graph) = self.existing_graph(touched, &old.model_name) else {
            tracing::debug!(key = %ctx.key, host, model = %old.model_name, "model already gone");
            return;
        };

        graph.update(|nodes| {
            let Some(vs) = nodes.virtual_service_mut() else {
                let err = Error::MissingVirtualService(old.model_name.clone());
                tracing::warn!(key = %ctx.key, host, %err, "can't tear down host");
                return;
            };

            let evh = vs.evh_parent;
            match old.mode {
                HostMode::Passthrough => ctx.delete_passthrough_host(vs, ing, host),
                _ if old.dedicated => ctx.delete_dedicated_host_paths(vs, ing, host, paths),
                HostMode::Insecure if !evh => ctx.delete_insecure_host(vs, ing, host, paths),
                _ => ctx.delete_vh_child_paths(vs, ing, host, paths, evh),
            }
        });
    }

    fn build_host(
        &self,
        ctx: &BuildContext<'_, L>,
        touched: &mut Touched,
        ingress: &IngressSpec,
        host: &str,
        plan: &HostPlan,
    ) -> Result<()> {
        let graph = self.graph_for(ctx, touched, &plan.record);
        let ing = IngressRef::from_spec(ingress);
        let dedicated = plan.record.dedicated;

        graph.update(|nodes| {
            let Some(vs) = nodes.virtual_service_mut() else {
                return Err(Error::MissingVirtualService(plan.record.model_name.clone()));
            };

            let evh = vs.evh_parent;
            match plan.build {
                HostBuild::Passthrough { backends, redirect } => {
                    ctx.build_passthrough_host(vs, &ing, host, backends, redirect);
                    Ok(())
                }
                HostBuild::Insecure { paths } if dedicated => {
                    ctx.build_dedicated_host(vs, &ing, host, None, paths)
                }
                HostBuild::Secure { tls, paths } if dedicated => {
                    ctx.build_dedicated_host(vs, &ing, host, Some(tls), paths)
                }
                HostBuild::Insecure { paths } if !evh => {
                    ctx.build_insecure_host(vs, &ing, host, paths);
                    Ok(())
                }
                HostBuild::Insecure { paths } => ctx.build_vh_child(vs, &ing, host, None, paths, evh),
                HostBuild::Secure { tls, paths } => {
                    ctx.build_vh_child(vs, &ing, host, Some(tls), paths, evh)
                }
            }
        })
    }

    // Run every touched graph through the publish gate.
    //
    // Whether a model is saved or tombstoned is decided under its lock, so
    // another event's mutation either lands in this checksum or happens after
    // it and goes through the gate on its own.
    fn publish(&self, key: &str, touched: Touched) -> Vec<String> {
        let mut changed = Vec::new();
        for (model, graph) in touched {
            let published = graph.read(|nodes| {
                if nodes.virtual_services().any(serves_hosts) || self.keeps_dedicated(&model, nodes) {
                    return self.store.commit(&model, &graph, nodes.checksum());
                }

                let retired = self.store.retire(&model, &graph);
                if retired {
                    tracing::info!(key, %model, "model serves no hosts, tombstoned");
                }
                retired
            });
            if published {
                changed.push(model);
            }
        }
        changed
    }

    // A live dedicated virtual service stays up while any ingress still has
    // a host placed on it, even with nothing left to serve.
    fn keeps_dedicated(&self, model: &str, nodes: &GraphNodes) -> bool {
        nodes.virtual_services().any(|vs| vs.dedicated)
            && self.store.get(model).is_some()
            && self.caches.ingress_hosts.references_model(model)
    }
}

fn serves_hosts(vs: &VirtualServiceNode) -> bool {
    !vs.pools.is_empty()
        || !vs.sni_children.is_empty()
        || !vs.evh_children.is_empty()
        || !vs.passthrough_children.is_empty()
}
