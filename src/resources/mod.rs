/// ManagedClusterAddOn
pub mod addons;
/// BareMetalAsset, the only CRD owned by this operator
pub mod baremetalassets;
/// Hive ClusterDeployment, ClusterPool, SyncSet and ClusterSync
pub mod hive;
/// ManagedCluster and ManagedClusterSet
pub mod managedclusters;
/// ManifestWork
pub mod manifestworks;
