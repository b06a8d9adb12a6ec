// LSM planner/executor and stable on-disk column-chunk format: out of
// scope. An embedded store (`redb`, see submerge-rowdb) stands in as the
// opaque local-persistence interface instead. Left as a placeholder crate,
// same as submerge-user/submerge-auth/submerge-cloud/submerge-adapt/
// submerge-money/submerge-test.
