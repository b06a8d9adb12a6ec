// Incrementalism, metaprograms, staging, triggers: out of scope for the
// data plane this workspace currently builds out. Left as a placeholder
// crate, same as submerge-user/submerge-auth/submerge-cloud/submerge-adapt/
// submerge-money/submerge-test.
