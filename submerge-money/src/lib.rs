// User-billing, payment, subscription, licensing, commissions: out of scope
// for the data plane this workspace currently builds out. Left as a
// placeholder crate.
