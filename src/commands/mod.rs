// Read-only inspection and the status dashboard
pub mod inspect;

// Install / repair / uninstall convergence flows
pub mod converge;
