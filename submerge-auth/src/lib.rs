// Authentication, authorization, endorsement, signatures: out of scope for
// the data plane this workspace currently builds out. Left as a placeholder
// crate.
